use serde_json::Value;

use crate::error::Result;

pub mod executor;
pub mod orderer;
pub mod parser;
pub mod plan;
pub mod validator;

pub use executor::{PlanAction, PlanExecutor};
pub use parser::ParseOptions;
pub use plan::{SecretPlan, SelfSigned, X509Plan};
pub use validator::PlanValidator;

/// Result class of one processed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Skipped,
    Missing,
    Warn,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Skipped => "skipped",
            Outcome::Missing => "missing",
            Outcome::Warn => "warn",
            Outcome::Error => "error",
        }
    }

    /// Status glyph for console reporting.
    pub fn glyph(&self) -> &'static str {
        match self {
            Outcome::Ok => "✔",
            Outcome::Skipped => "─",
            Outcome::Missing => "✘",
            Outcome::Warn => "⚠",
            Outcome::Error => "✘",
        }
    }
}

/// One processed plan with its class and a human-readable, possibly
/// multi-line explanation.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub path: String,
    pub outcome: Outcome,
    pub detail: String,
}

impl ItemReport {
    pub fn new(path: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            outcome,
            detail: detail.into(),
        }
    }
}

/// Per-class counters aggregated over one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub ok: usize,
    pub skipped: usize,
    pub missing: usize,
    pub error: usize,
    pub warn: usize,
}

impl CheckSummary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Missing => self.missing += 1,
            Outcome::Warn => self.warn += 1,
            Outcome::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.skipped + self.missing + self.error + self.warn
    }

    /// Aggregate failure status: errors and missing secrets always fail;
    /// warnings fail only under strict mode.
    pub fn failed(&self, strict: bool) -> bool {
        self.error > 0 || self.missing > 0 || (strict && self.warn > 0)
    }
}

/// Progress protocol between the engine and whoever renders it. The engine
/// never prints; the sink owns all presentation state.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// A long store operation is starting (e.g. snapshot export).
    Wait { message: &'a str },
    WaitDone,
    /// The batch is about to run.
    Init { action: &'a str, total: usize },
    StartItem { index: usize, plan: &'a SecretPlan },
    DoneItem { index: usize, report: &'a ItemReport },
    /// The engine needs the caller to relay a question to the user.
    Prompt { message: &'a str },
    /// Nothing matched the requested plans.
    Empty,
    /// The batch stopped early; remaining items were not processed.
    Abort { message: &'a str },
    Completed { summary: &'a CheckSummary },
}

pub trait ProgressSink {
    fn on_event(&mut self, event: ProgressEvent<'_>);
}

/// Sink that drops every event; for callers that only want the summary.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&mut self, _event: ProgressEvent<'_>) {}
}

/// Full plan sequence for an environment: certificates in signing order
/// first, then every other type in sorted path order.
pub fn plans_for(metadata: &Value, features: &[String], options: &ParseOptions) -> Result<Vec<SecretPlan>> {
    let parsed = parser::parse(metadata, features, options)?;
    let mut x509 = Vec::new();
    let mut rest = Vec::new();
    for plan in parsed {
        match plan {
            SecretPlan::X509(p) => x509.push(p),
            other => rest.push(other),
        }
    }
    let mut sequence = orderer::order(x509, options.root_ca_path.as_deref());
    rest.sort_by_key(|p| p.path());
    sequence.extend(rest);
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_places_ordered_certs_before_sorted_rest() {
        let metadata: Value = serde_yaml_bw::from_str(
            r#"
certificates:
  base:
    tls:
      ca: { is_ca: true }
      server: { names: [api.example] }
credentials:
  base:
    zz/key: rsa 2048
    aa/users:
      pass: random 32
"#,
        )
        .unwrap();
        let sequence = plans_for(&metadata, &[], &ParseOptions::new()).unwrap();
        let paths: Vec<String> = sequence.iter().map(|p| p.path()).collect();
        assert_eq!(paths, vec!["tls/ca", "tls/server", "aa/users:pass", "zz/key"]);
    }

    #[test]
    fn summary_failure_classes() {
        let mut summary = CheckSummary::default();
        summary.record(Outcome::Ok);
        summary.record(Outcome::Warn);
        assert!(!summary.failed(false));
        assert!(summary.failed(true));
        summary.record(Outcome::Missing);
        assert!(summary.failed(false));
    }
}
