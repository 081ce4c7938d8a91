use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GenesisError, Result};
use crate::prompt::Prompter;
use crate::store::SafeRunner;

/// One known credentials-store endpoint, as the external CLI reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreTarget {
    pub name: String,
    pub url: String,
    /// False when TLS verification is disabled for this endpoint.
    pub verify: bool,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    name: String,
    url: String,
    #[serde(default)]
    verify: Option<bool>,
    #[serde(default)]
    skip_verify: Option<bool>,
}

impl From<RawTarget> for StoreTarget {
    fn from(raw: RawTarget) -> Self {
        let verify = raw
            .verify
            .unwrap_or_else(|| !raw.skip_verify.unwrap_or(false));
        StoreTarget {
            name: raw.name,
            url: raw.url,
            verify,
        }
    }
}

/// Optional criteria for narrowing the target list. Empty filter matches all.
#[derive(Debug, Default, Clone)]
pub struct TargetFilter {
    pub name: Option<String>,
    pub url: Option<String>,
    pub verify: Option<bool>,
}

/// The set of targets known to the store CLI, loaded once per context.
pub struct TargetRegistry {
    targets: Vec<StoreTarget>,
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_ascii_lowercase()
}

impl TargetRegistry {
    /// Load from `targets --json`.
    pub fn load(runner: &Arc<dyn SafeRunner>) -> Result<Self> {
        let args = vec!["targets".to_string(), "--json".to_string()];
        let out = runner.run(None, &args, false)?;
        if !out.success() {
            return Err(GenesisError::Store {
                target: "(all)".into(),
                state: "unavailable".into(),
                remedy: format!("`safe targets` failed: {}", out.combined()),
            });
        }
        let raw: Vec<RawTarget> = serde_json::from_str(&out.stdout)?;
        Ok(Self {
            targets: raw.into_iter().map(StoreTarget::from).collect(),
        })
    }

    pub fn from_targets(targets: Vec<StoreTarget>) -> Self {
        Self { targets }
    }

    pub fn all(&self) -> &[StoreTarget] {
        &self.targets
    }

    /// Add a target, enforcing one registered target per URL.
    pub fn register(&mut self, target: StoreTarget) -> Result<()> {
        let url = normalize_url(&target.url);
        if let Some(existing) = self
            .targets
            .iter()
            .find(|t| normalize_url(&t.url) == url)
        {
            return Err(GenesisError::Config(format!(
                "target {} already uses {} (attempted to register {})",
                existing.name, existing.url, target.name
            )));
        }
        self.targets.push(target);
        Ok(())
    }

    pub fn find(&self, filter: &TargetFilter) -> Vec<&StoreTarget> {
        self.targets
            .iter()
            .filter(|t| {
                filter.name.as_deref().is_none_or(|n| t.name == n)
                    && filter
                        .url
                        .as_deref()
                        .is_none_or(|u| normalize_url(&t.url) == normalize_url(u))
                    && filter.verify.is_none_or(|v| t.verify == v)
            })
            .collect()
    }

    /// Resolve an alias or URL to exactly one target. URL collisions are
    /// never silently picked; callers wanting every alias use
    /// [`TargetRegistry::resolve_all`].
    pub fn resolve(&self, target: &str) -> Result<&StoreTarget> {
        let matches = self.resolve_all(target)?;
        if matches.len() > 1 {
            let aliases: Vec<&str> = matches.iter().map(|t| t.name.as_str()).collect();
            return Err(GenesisError::Config(format!(
                "{} is targeted by multiple aliases ({}); name one explicitly",
                target,
                aliases.join(", ")
            )));
        }
        Ok(matches[0])
    }

    /// Every target matching an alias or URL; fails when none match.
    pub fn resolve_all(&self, target: &str) -> Result<Vec<&StoreTarget>> {
        let filter = if target.starts_with("http://") || target.starts_with("https://") {
            TargetFilter {
                url: Some(target.to_string()),
                ..TargetFilter::default()
            }
        } else {
            TargetFilter {
                name: Some(target.to_string()),
                ..TargetFilter::default()
            }
        };
        let matches = self.find(&filter);
        if matches.is_empty() {
            return Err(GenesisError::Store {
                target: target.to_string(),
                state: "unknown".into(),
                remedy: "add it with `safe target` or check the spelling".into(),
            });
        }
        Ok(matches)
    }

    /// Interactive picker. Endpoints reached by more than one alias are
    /// hidden, with a warning, so the selection is unambiguous.
    pub fn pick(&self, prompter: &dyn Prompter) -> Result<&StoreTarget> {
        let mut by_url: BTreeMap<String, Vec<&StoreTarget>> = BTreeMap::new();
        for target in &self.targets {
            by_url.entry(normalize_url(&target.url)).or_default().push(target);
        }
        let mut options = Vec::new();
        let mut candidates = Vec::new();
        for (url, group) in &by_url {
            if group.len() > 1 {
                let aliases: Vec<&str> = group.iter().map(|t| t.name.as_str()).collect();
                warn!(
                    "hiding {} from selection; multiple aliases point at it ({})",
                    url,
                    aliases.join(", ")
                );
                continue;
            }
            let target = group[0];
            options.push(format!(
                "{} ({}{})",
                target.name,
                target.url,
                if target.verify { "" } else { ", noverify" }
            ));
            candidates.push(target);
        }
        if candidates.is_empty() {
            return Err(GenesisError::Store {
                target: "(all)".into(),
                state: "unselectable".into(),
                remedy: "no unambiguous targets available; use an explicit alias".into(),
            });
        }
        let index = prompter.select("Select a secrets store target:", &options)?;
        Ok(candidates[index])
    }
}
