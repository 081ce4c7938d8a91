use std::fs;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use crate::bosh::{BoshDriver, BoshRunner, resolve_stemcell};
use crate::configs::ConfigFetcher;
use crate::context::Context;
use crate::env::{Environment, Merger, Reaction, lookup};
use crate::error::{GenesisError, Result};
use crate::hooks::{ExternalTask, HookEnv, base_hook_env, run_task};
use crate::kit::KitRuntime;
use crate::secrets::validator::OpensslInspector;
use crate::secrets::{
    CheckSummary, ParseOptions, PlanValidator, ProgressSink, SecretPlan, plans_for,
};

static BOSH_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(\(\s*!?([a-zA-Z0-9_.\-/]+)\s*\)\)$").unwrap());

/// Caller-supplied knobs for one deploy run.
#[derive(Debug, Default, Clone)]
pub struct DeployOptions {
    /// Extra flags passed through to the BOSH invocation.
    pub flags: Vec<String>,
    /// Validate everything but skip state persistence and post-deploy work.
    pub dry_run: bool,
    /// Confirmations are assumed answered yes.
    pub yes: bool,
    /// Promote warnings to failures.
    pub strict: bool,
}

/// Drives the deploy pipeline: check, manifest, pre-deploy hook, reactions,
/// deploy, post-deploy, Exodus publication.
pub struct Reactor<'a> {
    ctx: &'a Context,
    environment: &'a Environment,
    kit: &'a KitRuntime,
    merger: &'a dyn Merger,
    bosh: Arc<dyn BoshRunner>,
}

struct Prepared {
    features: Vec<String>,
    plans: Vec<SecretPlan>,
    driver: BoshDriver,
    fetcher: ConfigFetcher,
    hook_env: HookEnv,
}

impl<'a> Reactor<'a> {
    pub fn new(
        ctx: &'a Context,
        environment: &'a Environment,
        kit: &'a KitRuntime,
        merger: &'a dyn Merger,
        bosh: Arc<dyn BoshRunner>,
    ) -> Self {
        Self {
            ctx,
            environment,
            kit,
            merger,
            bosh,
        }
    }

    fn plan_options(&self) -> ParseOptions {
        let mut options = ParseOptions::new();
        options.root_ca_path = self.environment.root_ca_path.clone();
        options
    }

    /// Director session for this environment, built from the deploying
    /// director's own Exodus record.
    fn director(&self) -> Result<BoshDriver> {
        if self.environment.use_create_env {
            return Ok(BoshDriver::local(self.bosh.clone()));
        }
        let bosh_env = &self.environment.bosh_env;
        let exodus_path = self
            .environment
            .exodus_path_for(&bosh_env.alias, &bosh_env.deployment_type);
        let exodus = self.ctx.store.get(&exodus_path)?;
        if exodus.is_empty() {
            return Err(GenesisError::Deploy {
                env: self.environment.name.as_str().to_string(),
                detail: format!(
                    "no Exodus data at {exodus_path}; deploy the {} director first",
                    bosh_env.alias
                ),
            });
        }
        BoshDriver::from_exodus(&bosh_env.alias, &exodus, self.bosh.clone())
    }

    fn prepare(&self, workdir: &Path) -> Result<Prepared> {
        let params = self.environment.params(self.merger)?;
        let mut hook_env = base_hook_env(
            self.environment,
            self.kit,
            &self.ctx.store,
            Some(&params),
        );
        let features =
            self.kit
                .final_features(&self.ctx.root, &self.environment.features, &hook_env)?;
        let plans = plans_for(&self.kit.metadata, &features, &self.plan_options())?;

        let driver = self.director()?;
        let mut fetcher = ConfigFetcher::new(workdir);
        if !self.environment.use_create_env {
            for (config_type, name) in self.kit.required_configs() {
                fetcher.fetch(&driver, &config_type, &name)?;
            }
            for (key, value) in driver.connection_env() {
                hook_env.insert(key, value.clone());
            }
            for (key, value) in self.credhub_env_vars()? {
                hook_env.insert(&key, value);
            }
        }
        for (key, value) in fetcher.env_exports() {
            hook_env.insert(&key, value);
        }
        Ok(Prepared {
            features,
            plans,
            driver,
            fetcher,
            hook_env,
        })
    }

    /// CREDHUB_* contract values, read from the Exodus record of the
    /// credhub source (`genesis.credhub_env` override, else the deploying
    /// director).
    fn credhub_env_vars(&self) -> Result<Vec<(String, String)>> {
        let (env_name, deployment_type) = match &self.environment.credhub_env {
            Some(spec) => match spec.split_once('/') {
                Some((env, dtype)) => (env.to_string(), dtype.to_string()),
                None => (spec.clone(), "bosh".to_string()),
            },
            None => (
                self.environment.bosh_env.alias.clone(),
                self.environment.bosh_env.deployment_type.clone(),
            ),
        };
        let exodus = self
            .ctx
            .store
            .get(&self.environment.exodus_path_for(&env_name, &deployment_type))?;
        let mut vars = Vec::new();
        for (key, var) in [
            ("credhub_url", "CREDHUB_SERVER"),
            ("credhub_username", "CREDHUB_CLIENT"),
            ("credhub_password", "CREDHUB_SECRET"),
            ("credhub_ca_cert", "CREDHUB_CA_CERT"),
        ] {
            if let Some(value) = exodus.get(key) {
                vars.push((var.to_string(), value.clone()));
            }
        }
        Ok(vars)
    }

    fn run_check_hook(&self, hook_env: &HookEnv) -> Result<()> {
        if !self.kit.has_hook("check") {
            return Ok(());
        }
        let task = ExternalTask::KitHook {
            kit: self.kit,
            hook: "check",
            args: Vec::new(),
        };
        let outcome = run_task(&task, &self.ctx.root, hook_env, false)?;
        if !outcome.success() {
            return Err(GenesisError::Kit(format!(
                "check hook of kit {} failed (exit {})",
                self.kit.id(),
                outcome.status
            )));
        }
        Ok(())
    }

    fn verify_stemcells(&self, manifest: &Value, driver: &BoshDriver) -> Result<()> {
        let Some(wanted) = manifest.get("stemcells").and_then(Value::as_array) else {
            return Ok(());
        };
        if wanted.is_empty() {
            return Ok(());
        }
        let available = driver.stemcells()?;
        for entry in wanted {
            let Some(os) = entry.get("os").and_then(Value::as_str) else {
                continue;
            };
            let version = match entry.get("version") {
                Some(Value::String(v)) => v.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => "latest".to_string(),
            };
            if resolve_stemcell(&available, os, &version).is_none() {
                return Err(GenesisError::Deploy {
                    env: self.environment.name.as_str().to_string(),
                    detail: format!(
                        "stemcell {os}/{version} is not uploaded to the {} director",
                        driver.alias
                    ),
                });
            }
            info!("stemcell {os}/{version} available");
        }
        Ok(())
    }

    /// Pre-flight: store health, kit check hook, secret presence, required
    /// configs, stemcells. Returns the secret-check counters.
    pub fn check(&self, sink: &mut dyn ProgressSink) -> Result<CheckSummary> {
        self.ctx.store.require_ok(&self.environment.secrets_mount)?;
        let workdir = tempfile::tempdir()?;
        let prepared = self.prepare(workdir.path())?;
        self.run_check_hook(&prepared.hook_env)?;

        let inspector = OpensslInspector;
        let validator = PlanValidator::new(
            &self.ctx.store,
            &self.environment.secrets_base(),
            &inspector,
        );
        let summary = validator.check(&prepared.plans, sink)?;

        if !self.environment.use_create_env {
            let fragments =
                self.kit
                    .fragment_files(&self.ctx.root, &prepared.features, &prepared.hook_env)?;
            let manifest = self.environment.manifest(
                self.merger,
                &fragments,
                &prepared.fetcher.files(),
            )?;
            let manifest: Value = serde_yaml_bw::from_str(&manifest)?;
            self.verify_stemcells(&manifest, &prepared.driver)?;
        }
        Ok(summary)
    }

    /// Evaluated (or redacted) manifest for display, without deploying.
    pub fn manifest(&self, redacted: bool) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        let prepared = self.prepare(workdir.path())?;
        let fragments =
            self.kit
                .fragment_files(&self.ctx.root, &prepared.features, &prepared.hook_env)?;
        if redacted {
            self.environment
                .redacted_manifest(self.merger, &fragments, &prepared.fetcher.files())
        } else {
            self.environment
                .manifest(self.merger, &fragments, &prepared.fetcher.files())
        }
    }

    /// The full pipeline. Post-deploy reactions run even when the deploy
    /// fails; Exodus and the cached manifest are only touched on success.
    pub fn deploy(&self, options: &DeployOptions, sink: &mut dyn ProgressSink) -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let name = self.environment.name.as_str();

        self.ctx.store.require_ok(&self.environment.secrets_mount)?;
        let mut prepared = self.prepare(workdir.path())?;
        self.run_check_hook(&prepared.hook_env)?;

        let inspector = OpensslInspector;
        let validator = PlanValidator::new(
            &self.ctx.store,
            &self.environment.secrets_base(),
            &inspector,
        );
        let summary = validator.check(&prepared.plans, sink)?;
        if summary.failed(options.strict) {
            return Err(GenesisError::Config(format!(
                "{} of {} secrets are missing for {name}; run `genesis {name} secrets add`",
                summary.missing + summary.error,
                summary.total()
            )));
        }

        let fragments =
            self.kit
                .fragment_files(&self.ctx.root, &prepared.features, &prepared.hook_env)?;
        let config_files = prepared.fetcher.files();
        let manifest_text = self
            .environment
            .manifest(self.merger, &fragments, &config_files)?;
        let manifest_doc: Value = serde_yaml_bw::from_str(&manifest_text)?;
        if !self.environment.use_create_env {
            self.verify_stemcells(&manifest_doc, &prepared.driver)?;
        }

        let manifest_file = workdir.path().join(format!("{name}-manifest.yml"));
        fs::write(&manifest_file, &manifest_text)?;

        let vars_doc = manifest_doc
            .get("bosh-variables")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let vars_file = workdir.path().join(format!("{name}.vars"));
        fs::write(&vars_file, serde_yaml_bw::to_string(&vars_doc)?)?;

        let redacted_text =
            self.environment
                .redacted_manifest(self.merger, &fragments, &config_files)?;
        let redacted_file = workdir.path().join(format!("{name}-redacted.yml"));
        fs::write(&redacted_file, &redacted_text)?;

        prepared
            .hook_env
            .insert("GENESIS_MANIFEST_FILE", manifest_file.display().to_string());
        prepared
            .hook_env
            .insert("GENESIS_BOSHVARS_FILE", vars_file.display().to_string());
        prepared.hook_env.insert(
            "GENESIS_DEPLOY_OPTIONS",
            serde_json::to_string(&json!({
                "flags": options.flags.clone(),
                "dry_run": options.dry_run,
            }))?,
        );
        prepared.hook_env.insert(
            "GENESIS_DEPLOY_DRYRUN",
            if options.dry_run { "true" } else { "false" },
        );

        if self.kit.has_hook("pre-deploy") {
            let task = ExternalTask::KitHook {
                kit: self.kit,
                hook: "pre-deploy",
                args: Vec::new(),
            };
            let outcome = run_task(&task, &self.ctx.root, &prepared.hook_env, true)?;
            if !outcome.success() {
                return Err(GenesisError::Deploy {
                    env: name.to_string(),
                    detail: format!("pre-deploy hook exited {}", outcome.status),
                });
            }
            let datafile = workdir.path().join(format!("{name}-predeploy-data"));
            fs::write(&datafile, outcome.stdout)?;
            prepared
                .hook_env
                .insert("GENESIS_PREDEPLOY_DATAFILE", datafile.display().to_string());
        }

        self.run_reactions(&self.environment.pre_deploy_reactions, &mut prepared.hook_env)?;

        self.check_drift(options)?;

        let deploy_result = self.run_deploy(&prepared, &manifest_file, &vars_file, options);
        let rc = if deploy_result.is_ok() { 0 } else { 1 };

        if options.dry_run {
            return deploy_result;
        }

        if deploy_result.is_ok() {
            self.persist_manifests(&redacted_text, &vars_file)?;
            self.publish_exodus(&manifest_doc, &vars_doc, &sha1_hex(redacted_text.as_bytes()))?;
            prepared.hook_env.insert("GENESIS_DEPLOY_RC", "0");
            if self.kit.has_hook("post-deploy") {
                let task = ExternalTask::KitHook {
                    kit: self.kit,
                    hook: "post-deploy",
                    args: Vec::new(),
                };
                let outcome = run_task(&task, &self.ctx.root, &prepared.hook_env, false)?;
                if !outcome.success() {
                    warn!("post-deploy hook exited {}", outcome.status);
                }
            }
        } else {
            prepared.hook_env.insert("GENESIS_DEPLOY_RC", rc.to_string());
        }

        let reactions =
            self.run_reactions(&self.environment.post_deploy_reactions, &mut prepared.hook_env);
        match deploy_result {
            Ok(()) => reactions,
            Err(err) => {
                if let Err(reaction_err) = reactions {
                    warn!("post-deploy reaction failed after deploy error: {reaction_err}");
                }
                Err(err)
            }
        }
    }

    fn run_deploy(
        &self,
        prepared: &Prepared,
        manifest_file: &Path,
        vars_file: &Path,
        options: &DeployOptions,
    ) -> Result<()> {
        if self.environment.use_create_env {
            if options.dry_run {
                info!("dry-run: skipping create-env invocation");
                return Ok(());
            }
            let manifests = self.ctx.manifests_dir();
            fs::create_dir_all(&manifests)?;
            let state_file = manifests.join(format!("{}-state.yml", self.environment.name));
            prepared
                .driver
                .create_env(manifest_file, &state_file, Some(vars_file), &options.flags)
        } else {
            let mut flags = options.flags.clone();
            if options.dry_run {
                flags.push("--dry-run".into());
            }
            prepared
                .driver
                .deploy(&self.environment.deployment_name(), manifest_file, &flags)
        }
    }

    fn run_reactions(&self, reactions: &[Reaction], hook_env: &mut HookEnv) -> Result<()> {
        for reaction in reactions {
            let (task, var, label) = match reaction {
                Reaction::Script { script, args, var } => (
                    ExternalTask::ReactionScript { script, args },
                    var,
                    format!("script {script}"),
                ),
                Reaction::Addon { addon, args, var } => (
                    ExternalTask::ReactionAddon {
                        kit: self.kit,
                        addon,
                        args,
                    },
                    var,
                    format!("addon {addon}"),
                ),
            };
            let capture = var.is_some();
            let outcome = run_task(&task, &self.ctx.root, hook_env, capture)?;
            if !outcome.success() {
                return Err(GenesisError::Deploy {
                    env: self.environment.name.as_str().to_string(),
                    detail: format!("reaction {label} exited {}", outcome.status),
                });
            }
            if let Some(var) = var {
                hook_env.insert(var, outcome.stdout.trim_end().to_string());
            }
        }
        Ok(())
    }

    /// The cached manifest must match what the store says was last deployed;
    /// a drifted cache needs explicit confirmation.
    fn check_drift(&self, options: &DeployOptions) -> Result<()> {
        let cached = self
            .ctx
            .manifests_dir()
            .join(format!("{}.yml", self.environment.name));
        if !cached.exists() {
            return Ok(());
        }
        let recorded = self
            .ctx
            .store
            .get(&self.environment.exodus_path())?
            .remove("manifest_sha1");
        let Some(recorded) = recorded else {
            return Ok(());
        };
        let local = sha1_hex(&fs::read(&cached)?);
        if local == recorded {
            return Ok(());
        }
        warn!(
            "cached manifest {} does not match the last deployed manifest",
            cached.display()
        );
        if options.yes {
            return Ok(());
        }
        let proceed = self.ctx.prompter.confirm(
            "The cached manifest differs from what was last deployed. Deploy anyway?",
        )?;
        if proceed {
            Ok(())
        } else {
            Err(GenesisError::Deploy {
                env: self.environment.name.as_str().to_string(),
                detail: "aborted: cached manifest drift was not confirmed".into(),
            })
        }
    }

    fn persist_manifests(&self, redacted: &str, vars_file: &Path) -> Result<()> {
        let manifests = self.ctx.manifests_dir();
        fs::create_dir_all(&manifests)?;
        fs::write(
            manifests.join(format!("{}.yml", self.environment.name)),
            redacted,
        )?;
        fs::copy(
            vars_file,
            manifests.join(format!("{}.vars", self.environment.name)),
        )?;
        Ok(())
    }

    /// Last side effect of a successful deploy: the record is removed and
    /// rewritten in one store invocation each.
    fn publish_exodus(&self, manifest: &Value, vars: &Value, manifest_sha1: &str) -> Result<()> {
        let mut pairs = Vec::new();
        if let Some(exodus) = manifest.get("exodus") {
            flatten_exodus("", exodus, &mut pairs);
        }
        for (_, value) in pairs.iter_mut() {
            if let Some(resolved) = interpolate_bosh_var(value, vars) {
                *value = resolved;
            }
        }
        pairs.push(("manifest_sha1".to_string(), manifest_sha1.to_string()));
        let path = self.environment.exodus_path();
        self.ctx.store.rm(&path)?;
        self.ctx.store.set_many(&path, &pairs)?;
        info!("published Exodus data to {path}");
        Ok(())
    }
}

/// Flatten the `exodus` subtree into dotted scalar keys.
pub fn flatten_exodus(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_exodus(&path, child, out);
            }
        }
        Value::Array(list) => {
            for (index, child) in list.iter().enumerate() {
                flatten_exodus(&format!("{prefix}.{index}"), child, out);
            }
        }
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

/// A value that is exactly one `((var))` reference resolves from the BOSH
/// variables document; anything else passes through untouched.
fn interpolate_bosh_var(value: &str, vars: &Value) -> Option<String> {
    let caps = BOSH_VAR_RE.captures(value.trim())?;
    let name = caps[1].to_string();
    match lookup(vars, &name).or_else(|| vars.get(name.as_str())) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let digest = Sha1::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn flatten_produces_dotted_scalars() {
        let doc = json!({
            "api": { "url": "https://cf.example", "admin": { "user": "admin" } },
            "azs": ["z1", "z2"],
            "count": 3,
            "nothing": null,
        });
        let mut pairs = Vec::new();
        flatten_exodus("", &doc, &mut pairs);
        let map: BTreeMap<String, String> = pairs.into_iter().collect();
        assert_eq!(map["api.url"], "https://cf.example");
        assert_eq!(map["api.admin.user"], "admin");
        assert_eq!(map["azs.0"], "z1");
        assert_eq!(map["count"], "3");
        assert_eq!(map["nothing"], "");
    }

    #[test]
    fn bosh_var_interpolation_is_exact_match_only() {
        let vars = json!({"admin_password": "s3cret", "nested": {"a": "b"}});
        assert_eq!(
            interpolate_bosh_var("((admin_password))", &vars).as_deref(),
            Some("s3cret")
        );
        assert_eq!(
            interpolate_bosh_var("(( nested.a ))", &vars).as_deref(),
            Some("b")
        );
        assert!(interpolate_bosh_var("prefix ((admin_password))", &vars).is_none());
        assert!(interpolate_bosh_var("((unknown))", &vars).is_none());
    }

    #[test]
    fn sha1_matches_known_vector() {
        assert_eq!(
            sha1_hex(b"hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
    }
}
