use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{GenesisError, Result};
use crate::secrets::plan::{SecretPlan, SelfSigned, X509Plan};
use crate::secrets::{CheckSummary, ItemReport, Outcome, ProgressEvent, ProgressSink};
use crate::store::StoreClient;

static SKIPPED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"refusing to .* already present").unwrap());
static RENEWED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Renewed x509 cert.*expiry set to (.+)$").unwrap());

/// Lifecycle operation applied to a plan batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Add,
    Recreate,
    Renew,
    Remove,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::Add => "add",
            PlanAction::Recreate => "recreate",
            PlanAction::Renew => "renew",
            PlanAction::Remove => "remove",
        }
    }
}

/// Runs plans against the store, strictly serially and in sequence order so
/// a CA is always materialized before its dependents.
pub struct PlanExecutor<'a> {
    store: &'a StoreClient,
    /// Prefix joining plan paths to full store paths; ends with `/`.
    base: String,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(store: &'a StoreClient, base: &str) -> Self {
        let mut base = base.trim_end_matches('/').to_string();
        if !base.is_empty() {
            base.push('/');
        }
        Self { store, base }
    }

    fn full_path(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Execute `action` over `plans`. Per-item problems are recorded and the
    /// batch continues; a failing store subprocess aborts immediately.
    pub fn execute(
        &self,
        action: PlanAction,
        plans: &[SecretPlan],
        sink: &mut dyn ProgressSink,
    ) -> Result<CheckSummary> {
        let mut summary = CheckSummary::default();
        if plans.is_empty() {
            sink.on_event(ProgressEvent::Empty);
            return Ok(summary);
        }
        sink.on_event(ProgressEvent::Init {
            action: action.as_str(),
            total: plans.len(),
        });
        for (index, plan) in plans.iter().enumerate() {
            sink.on_event(ProgressEvent::StartItem { index, plan });
            let report = match plan {
                SecretPlan::Error(err) => {
                    ItemReport::new(err.path.clone(), Outcome::Error, err.error.clone())
                }
                _ => match self.run_item(action, plan) {
                    Ok(report) => report,
                    Err(err) => {
                        let message = format!("{err}");
                        sink.on_event(ProgressEvent::Abort { message: &message });
                        return Err(err);
                    }
                },
            };
            summary.record(report.outcome);
            sink.on_event(ProgressEvent::DoneItem {
                index,
                report: &report,
            });
        }
        sink.on_event(ProgressEvent::Completed { summary: &summary });
        Ok(summary)
    }

    fn run_item(&self, action: PlanAction, plan: &SecretPlan) -> Result<ItemReport> {
        let path = plan.path();
        let commands = self.commands_for(action, plan);
        if commands.is_empty() {
            return Ok(ItemReport::new(
                path,
                Outcome::Skipped,
                format!("{} not supported for {} secrets", action.as_str(), plan.kind()),
            ));
        }

        let mut combined = String::new();
        for command in &commands {
            debug!(path = %path, command = ?command, "store command");
            let out = self.store.query(command)?;
            let text = out.combined();
            if SKIPPED_RE.is_match(&text) {
                return Ok(ItemReport::new(path, Outcome::Skipped, "already present"));
            }
            if !out.success() {
                return Err(GenesisError::Subprocess {
                    command: format!("safe {}", command.join(" ")),
                    status: out.status,
                    output: text,
                });
            }
            if !text.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&text);
            }
        }

        if let Some(caps) = RENEWED_RE.captures(&combined) {
            return Ok(ItemReport::new(
                path,
                Outcome::Ok,
                format!("expiry set to {}", caps[1].trim()),
            ));
        }
        if combined.is_empty() {
            Ok(ItemReport::new(path, Outcome::Ok, ""))
        } else {
            Ok(ItemReport::new(path, Outcome::Error, combined))
        }
    }

    /// Store command list for one plan; empty means the action does not
    /// apply to the type and the item is reported skipped.
    pub fn commands_for(&self, action: PlanAction, plan: &SecretPlan) -> Vec<Vec<String>> {
        match (action, plan) {
            (PlanAction::Add, SecretPlan::X509(p)) => vec![self.x509_issue(p, true)],
            (PlanAction::Recreate, SecretPlan::X509(p)) => vec![self.x509_issue(p, false)],
            (PlanAction::Renew, SecretPlan::X509(p)) => vec![vec![
                "x509".into(),
                "renew".into(),
                self.full_path(&p.path),
                "--ttl".into(),
                p.ttl().into(),
            ]],
            (PlanAction::Remove, SecretPlan::X509(p)) => vec![self.rm(&p.path)],

            (PlanAction::Add, SecretPlan::Rsa(p)) => vec![self.keypair("rsa", p, true)],
            (PlanAction::Recreate, SecretPlan::Rsa(p)) => vec![self.keypair("rsa", p, p.fixed)],
            (PlanAction::Remove, SecretPlan::Rsa(p)) => vec![self.rm(&p.path)],

            (PlanAction::Add, SecretPlan::Ssh(p)) => vec![self.keypair("ssh", p, true)],
            (PlanAction::Recreate, SecretPlan::Ssh(p)) => vec![self.keypair("ssh", p, p.fixed)],
            (PlanAction::Remove, SecretPlan::Ssh(p)) => vec![self.rm(&p.path)],

            (PlanAction::Add, SecretPlan::Dhparams(p)) => vec![self.dhparam(p, true)],
            (PlanAction::Recreate, SecretPlan::Dhparams(p)) => vec![self.dhparam(p, p.fixed)],
            (PlanAction::Remove, SecretPlan::Dhparams(p)) => vec![self.rm(&p.path)],

            (PlanAction::Add, SecretPlan::Random(p)) => vec![self.gen_random(p, true)],
            (PlanAction::Recreate, SecretPlan::Random(p)) => vec![self.gen_random(p, p.fixed)],
            (PlanAction::Remove, SecretPlan::Random(p)) => {
                let mut commands = vec![self.rm(&format!("{}:{}", p.path, p.key))];
                if let Some(formatted) = p.formatted_key() {
                    commands.push(self.rm(&format!("{}:{}", p.path, formatted)));
                }
                commands
            }

            (PlanAction::Renew, _) => Vec::new(),
            (_, SecretPlan::Error(_)) => Vec::new(),
        }
    }

    fn x509_issue(&self, plan: &X509Plan, no_clobber: bool) -> Vec<String> {
        let mut command = vec![
            "x509".to_string(),
            "issue".to_string(),
            self.full_path(&plan.path),
            "--ttl".to_string(),
            plan.ttl().to_string(),
        ];
        if plan.is_ca {
            command.push("--ca".into());
        }
        let names = if plan.names.is_empty() && plan.is_ca {
            vec![synthesized_ca_cn(&plan.base_path)]
        } else {
            plan.names.clone()
        };
        for name in names {
            command.push("--name".into());
            command.push(name);
        }
        for usage in plan.effective_usage() {
            command.push("--key-usage".into());
            command.push(usage.to_string());
        }
        if plan.self_signed == SelfSigned::No {
            if let Some(signer) = &plan.signed_by {
                let signer = if plan.signed_by_abs_path {
                    signer.clone()
                } else {
                    self.full_path(signer)
                };
                command.push("--signed-by".into());
                command.push(signer);
            }
        }
        if no_clobber {
            command.push("--no-clobber".into());
        }
        command
    }

    fn keypair(&self, kind: &str, plan: &crate::secrets::plan::KeyPlan, no_clobber: bool) -> Vec<String> {
        let mut command = vec![
            kind.to_string(),
            plan.size.to_string(),
            self.full_path(&plan.path),
        ];
        if no_clobber {
            command.push("--no-clobber".into());
        }
        command
    }

    fn dhparam(&self, plan: &crate::secrets::plan::DhparamsPlan, no_clobber: bool) -> Vec<String> {
        let mut command = vec![
            "dhparam".to_string(),
            plan.size.to_string(),
            self.full_path(&plan.path),
        ];
        if no_clobber {
            command.push("--no-clobber".into());
        }
        command
    }

    fn gen_random(&self, plan: &crate::secrets::plan::RandomPlan, no_clobber: bool) -> Vec<String> {
        let mut command = vec!["gen".to_string(), plan.size.to_string()];
        if let Some(policy) = &plan.valid_chars {
            command.push("--policy".into());
            command.push(policy.clone());
        }
        command.push(self.full_path(&plan.path));
        command.push(plan.key.clone());
        if no_clobber {
            command.push("--no-clobber".into());
        }
        if let Some(format) = &plan.format {
            command.push("--".into());
            command.push("fmt".into());
            command.push(format.clone());
            command.push(self.full_path(&plan.path));
            command.push(plan.key.clone());
            command.push(plan.formatted_key().unwrap_or_default());
        }
        command
    }

    fn rm(&self, path: &str) -> Vec<String> {
        vec!["rm".into(), "-f".into(), self.full_path(path)]
    }
}

/// CN used when a CA plan declares no subject names.
fn synthesized_ca_cn(base_path: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("ca.n{nanos:09}.{base_path}")
}
