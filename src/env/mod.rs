use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{GenesisError, Result};

pub mod merge;

pub use merge::{ChdirGuard, EvalMode, MergeFailure, Merger, SpruceMerger, adaptive_merge};

static ENV_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*[a-z0-9]$").unwrap());

/// Validated environment name. Decomposes on `-` into the ancestor prefix
/// sequence used to assemble the merge file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvName(String);

impl EnvName {
    pub fn parse(name: &str) -> Result<Self> {
        if !ENV_NAME_RE.is_match(name) || name.contains("--") {
            return Err(GenesisError::Config(format!(
                "invalid environment name '{name}': lowercase alphanumerics, single hyphens, \
                 must start with a letter and end with a letter or digit"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `a-b-c` yields `a`, `a-b`, `a-b-c`.
    pub fn ancestors(&self) -> Vec<String> {
        let parts: Vec<&str> = self.0.split('-').collect();
        (1..=parts.len())
            .map(|take| parts[..take].join("-"))
            .collect()
    }
}

impl std::fmt::Display for EnvName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the deploying director: `<alias>[/<type>][@[url/]mount]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshEnvRef {
    pub alias: String,
    pub deployment_type: String,
    pub url: Option<String>,
    pub mount: Option<String>,
}

impl BoshEnvRef {
    pub fn parse(spec: &str, fallback_alias: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Self {
                alias: fallback_alias.to_string(),
                deployment_type: "bosh".into(),
                url: None,
                mount: None,
            });
        }
        let (left, right) = match spec.split_once('@') {
            Some((l, r)) => (l, Some(r)),
            None => (spec, None),
        };
        let (alias, deployment_type) = match left.split_once('/') {
            Some((a, t)) if !t.is_empty() => (a, t),
            _ => (left, "bosh"),
        };
        if alias.is_empty() {
            return Err(GenesisError::Config(format!(
                "invalid bosh_env '{spec}': empty alias"
            )));
        }
        let (url, mount) = match right {
            None => (None, None),
            Some(rest) => match rest.find("://") {
                Some(scheme_at) => {
                    let host_start = scheme_at + 3;
                    match rest[host_start..].find('/') {
                        Some(slash) => {
                            let split = host_start + slash;
                            (
                                Some(rest[..split].to_string()),
                                Some(rest[split + 1..].to_string()),
                            )
                        }
                        None => (Some(rest.to_string()), None),
                    }
                }
                None => (None, Some(rest.to_string())),
            },
        };
        Ok(Self {
            alias: alias.to_string(),
            deployment_type: deployment_type.to_string(),
            url,
            mount,
        })
    }
}

/// Pre/post-deploy reaction entry from `genesis.reactions.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    Script {
        script: String,
        args: Vec<String>,
        var: Option<String>,
    },
    Addon {
        addon: String,
        args: Vec<String>,
        var: Option<String>,
    },
}

fn parse_reactions(value: Option<&Value>, stage: &str) -> Result<Vec<Reaction>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value.as_array().ok_or_else(|| {
        GenesisError::Config(format!("genesis.reactions.{stage} must be a list"))
    })?;
    let mut reactions = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let object = entry.as_object().ok_or_else(|| {
            GenesisError::Config(format!("genesis.reactions.{stage}[{index}] must be a map"))
        })?;
        let args = object
            .get("args")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .map(|arg| match arg {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let var = object
            .get("var")
            .and_then(Value::as_str)
            .map(str::to_string);
        let reaction = match (
            object.get("script").and_then(Value::as_str),
            object.get("addon").and_then(Value::as_str),
        ) {
            (Some(script), None) => Reaction::Script {
                script: script.to_string(),
                args,
                var,
            },
            (None, Some(addon)) => Reaction::Addon {
                addon: addon.to_string(),
                args,
                var,
            },
            _ => {
                return Err(GenesisError::Config(format!(
                    "genesis.reactions.{stage}[{index}] must name exactly one of script or addon"
                )));
            }
        };
        reactions.push(reaction);
    }
    Ok(reactions)
}

#[derive(Debug)]
struct CachedParams {
    cwd: PathBuf,
    doc: Value,
}

/// One named, file-backed deployment target: its settings, its merge file
/// list, and its lazily built parameter view.
#[derive(Debug)]
pub struct Environment {
    pub name: EnvName,
    pub root: PathBuf,
    pub file: PathBuf,
    pub kit_name: String,
    pub kit_version: Option<String>,
    /// Metadata fragments merged over the kit's own declaration.
    pub kit_overrides: Option<Value>,
    pub features: Vec<String>,
    pub use_create_env: bool,
    pub bosh_env: BoshEnvRef,
    pub credhub_env: Option<String>,
    pub root_ca_path: Option<String>,
    pub secrets_mount: String,
    pub secrets_path: String,
    pub exodus_mount: String,
    pub ci_mount: String,
    pub min_version: Option<Version>,
    pub pre_deploy_reactions: Vec<Reaction>,
    pub post_deploy_reactions: Vec<Reaction>,
    params: RefCell<Option<CachedParams>>,
}

impl Environment {
    pub fn load(root: &Path, name: &str) -> Result<Self> {
        let name = EnvName::parse(name)?;
        let file = root.join(format!("{name}.yml"));
        if !file.exists() {
            return Err(GenesisError::EnvFile {
                file,
                detail: "environment file does not exist".into(),
            });
        }
        let doc: Value = serde_yaml_bw::from_str(&fs::read_to_string(&file)?)?;

        let declared = lookup(&doc, "genesis.env").and_then(Value::as_str);
        let declared = match declared {
            Some(env) => env,
            None => match lookup(&doc, "params.env").and_then(Value::as_str) {
                Some(env) => {
                    warn!("{}: params.env is deprecated; declare genesis.env", file.display());
                    env
                }
                None => {
                    return Err(GenesisError::EnvFile {
                        file,
                        detail: "missing genesis.env declaration".into(),
                    });
                }
            },
        };
        if declared != name.as_str() {
            return Err(GenesisError::EnvFile {
                file,
                detail: format!(
                    "genesis.env is '{declared}' but the file is named '{name}.yml'"
                ),
            });
        }

        let min_version = match lookup(&doc, "genesis.min_version").and_then(Value::as_str) {
            Some(spec) => {
                let min = Version::parse(spec.trim_start_matches('v')).map_err(|err| {
                    GenesisError::EnvFile {
                        file: file.clone(),
                        detail: format!("invalid genesis.min_version '{spec}': {err}"),
                    }
                })?;
                let running = Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version");
                if running < min {
                    return Err(GenesisError::Config(format!(
                        "environment {name} requires version {min} or newer (running {running})"
                    )));
                }
                Some(min)
            }
            None => None,
        };

        let kit_name = lookup(&doc, "kit.name")
            .and_then(Value::as_str)
            .ok_or_else(|| GenesisError::EnvFile {
                file: file.clone(),
                detail: "missing kit.name".into(),
            })?
            .to_string();
        let kit_version = lookup(&doc, "kit.version")
            .and_then(Value::as_str)
            .map(str::to_string);
        let kit_overrides = lookup(&doc, "kit.overrides").cloned();
        let mut features = Vec::new();
        if let Some(list) = lookup(&doc, "kit.features").and_then(Value::as_array) {
            for feature in list {
                let Some(feature) = feature.as_str() else {
                    return Err(GenesisError::EnvFile {
                        file,
                        detail: "kit.features entries must be strings".into(),
                    });
                };
                if feature.starts_with('+') {
                    return Err(GenesisError::EnvFile {
                        file,
                        detail: format!(
                            "feature '{feature}' is kit-internal and cannot be declared directly"
                        ),
                    });
                }
                features.push(feature.to_string());
            }
        }

        let secrets_mount = string_setting(&doc, "genesis.secrets_mount", "secret");
        let default_path = format!("{}/{}", name.as_str().replace('-', "/"), kit_name);
        let secrets_path = string_setting(&doc, "genesis.secrets_path", &default_path);
        let exodus_mount =
            string_setting(&doc, "genesis.exodus_mount", &format!("{secrets_mount}/exodus"));
        let ci_mount = string_setting(&doc, "genesis.ci_mount", &format!("{secrets_mount}/ci"));

        let bosh_env = BoshEnvRef::parse(
            lookup(&doc, "genesis.bosh_env")
                .and_then(Value::as_str)
                .unwrap_or(""),
            name.as_str(),
        )?;

        let pre_deploy_reactions =
            parse_reactions(lookup(&doc, "genesis.reactions.pre-deploy"), "pre-deploy")?;
        let post_deploy_reactions =
            parse_reactions(lookup(&doc, "genesis.reactions.post-deploy"), "post-deploy")?;

        Ok(Self {
            use_create_env: lookup(&doc, "genesis.use_create_env")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            credhub_env: lookup(&doc, "genesis.credhub_env")
                .and_then(Value::as_str)
                .map(str::to_string),
            root_ca_path: lookup(&doc, "genesis.root_ca_path")
                .and_then(Value::as_str)
                .map(str::to_string),
            name,
            root: root.to_path_buf(),
            file,
            kit_name,
            kit_version,
            kit_overrides,
            features,
            bosh_env,
            secrets_mount,
            secrets_path,
            exodus_mount,
            ci_mount,
            min_version,
            pre_deploy_reactions,
            post_deploy_reactions,
            params: RefCell::new(None),
        })
    }

    pub fn deployment_name(&self) -> String {
        format!("{}-{}", self.name, self.kit_name)
    }

    /// Store prefix under which this environment's secrets live.
    pub fn secrets_base(&self) -> String {
        format!(
            "{}/{}",
            self.secrets_mount.trim_matches('/'),
            self.secrets_path.trim_matches('/')
        )
    }

    /// Store path of this environment's Exodus record.
    pub fn exodus_path(&self) -> String {
        format!(
            "{}/{}/{}",
            self.exodus_mount.trim_matches('/'),
            self.name,
            self.kit_name
        )
    }

    /// Where another environment's Exodus record lives (director lookups).
    pub fn exodus_path_for(&self, env: &str, deployment_type: &str) -> String {
        format!(
            "{}/{}/{}",
            self.exodus_mount.trim_matches('/'),
            env,
            deployment_type
        )
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.join(".genesis").join("cached").join(self.name.as_str())
    }

    /// Cached copies from an upstream pipeline win over repo-root files.
    fn locate(&self, basename: &str) -> Option<PathBuf> {
        let cached = self.cache_dir().join(format!("{basename}.yml"));
        if cached.exists() {
            return Some(cached);
        }
        let local = self.root.join(format!("{basename}.yml"));
        local.exists().then_some(local)
    }

    /// Hierarchy files that exist on disk, each preceded by the files its
    /// `genesis.inherits` list names.
    pub fn hierarchy_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut seen = BTreeSet::new();
        for ancestor in self.name.ancestors() {
            let Some(path) = self.locate(&ancestor) else {
                debug!("no {ancestor}.yml in the hierarchy; skipping");
                continue;
            };
            self.push_with_inherits(&path, &mut files, &mut seen)?;
        }
        Ok(files)
    }

    fn push_with_inherits(
        &self,
        path: &Path,
        files: &mut Vec<PathBuf>,
        seen: &mut BTreeSet<PathBuf>,
    ) -> Result<()> {
        if !seen.insert(path.to_path_buf()) {
            return Ok(());
        }
        let doc: Value = serde_yaml_bw::from_str(&fs::read_to_string(path)?)?;
        if let Some(inherits) = lookup(&doc, "genesis.inherits").and_then(Value::as_array) {
            for inherited in inherits {
                let Some(basename) = inherited.as_str() else {
                    return Err(GenesisError::EnvFile {
                        file: path.to_path_buf(),
                        detail: "genesis.inherits entries must be strings".into(),
                    });
                };
                let inherited_path = self.locate(basename).ok_or_else(|| GenesisError::EnvFile {
                    file: path.to_path_buf(),
                    detail: format!("inherited file {basename}.yml does not exist"),
                })?;
                self.push_with_inherits(&inherited_path, files, seen)?;
            }
        }
        files.push(path.to_path_buf());
        Ok(())
    }

    /// Generated first file of every merge: defaults that later files refine.
    fn write_prologue(&self, workdir: &Path) -> Result<PathBuf> {
        let prologue = json!({
            "exodus": {},
            "genesis": {},
            "kit": { "features": [] },
            "meta": { "vault": self.secrets_base() },
            "params": {},
        });
        let path = workdir.join("000-prologue.yml");
        fs::write(&path, serde_yaml_bw::to_string(&prologue)?)?;
        Ok(path)
    }

    /// Generated last file: pins the deployment identity and the Exodus
    /// metadata skeleton.
    fn write_epilogue(&self, workdir: &Path) -> Result<PathBuf> {
        let deployer = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let epilogue = json!({
            "name": self.deployment_name(),
            "genesis": {
                "env": self.name.as_str(),
                "secrets_mount": self.secrets_mount.clone(),
                "secrets_path": self.secrets_path.clone(),
                "exodus_mount": self.exodus_mount.clone(),
                "ci_mount": self.ci_mount.clone(),
                "vault_base": self.secrets_base(),
            },
            "exodus": {
                "version": env!("CARGO_PKG_VERSION"),
                "time": chrono::Utc::now().to_rfc3339(),
                "deployer": deployer,
                "kit_name": self.kit_name.clone(),
                "kit_version": self.kit_version.clone().unwrap_or_default(),
                "features": self.features.join(","),
                "bosh": self.bosh_env.alias.clone(),
            },
        });
        let path = workdir.join("999-epilogue.yml");
        fs::write(&path, serde_yaml_bw::to_string(&epilogue)?)?;
        Ok(path)
    }

    /// File list for the parameter view: prologue, hierarchy, epilogue.
    pub fn params_file_sequence(&self, workdir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = vec![self.write_prologue(workdir)?];
        files.extend(self.hierarchy_files()?);
        files.push(self.write_epilogue(workdir)?);
        Ok(files)
    }

    /// Full file list for the manifest view: prologue, kit fragments,
    /// downloaded configs, hierarchy, epilogue.
    pub fn manifest_file_sequence(
        &self,
        workdir: &Path,
        kit_fragments: &[PathBuf],
        config_files: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        let mut files = vec![self.write_prologue(workdir)?];
        files.extend(kit_fragments.iter().cloned());
        if !self.use_create_env {
            files.extend(config_files.iter().cloned());
        }
        files.extend(self.hierarchy_files()?);
        files.push(self.write_epilogue(workdir)?);
        Ok(files)
    }

    /// Parameter view: merged with evaluation suppressed, cached until the
    /// working directory changes.
    pub fn params(&self, merger: &dyn Merger) -> Result<Value> {
        let cwd = std::env::current_dir()?;
        if let Some(cached) = self.params.borrow().as_ref() {
            if cached.cwd == cwd {
                return Ok(cached.doc.clone());
            }
        }
        let workdir = tempfile::tempdir()?;
        let files = self.params_file_sequence(workdir.path())?;
        let merged = {
            let _guard = ChdirGuard::enter(&self.root)?;
            adaptive_merge(merger, &files, EvalMode::Skip)?
        };
        let doc: Value = serde_yaml_bw::from_str(&merged)?;
        *self.params.borrow_mut() = Some(CachedParams {
            cwd,
            doc: doc.clone(),
        });
        Ok(doc)
    }

    /// Fully evaluated manifest, with unresolvable operators deferred.
    pub fn manifest(
        &self,
        merger: &dyn Merger,
        kit_fragments: &[PathBuf],
        config_files: &[PathBuf],
    ) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        let files = self.manifest_file_sequence(workdir.path(), kit_fragments, config_files)?;
        let _guard = ChdirGuard::enter(&self.root)?;
        adaptive_merge(merger, &files, EvalMode::Full)
    }

    /// Manifest with evaluation suppressed: deferred operators stay as
    /// references instead of resolved secrets. This is the rendering that
    /// may be written to disk and cached.
    pub fn redacted_manifest(
        &self,
        merger: &dyn Merger,
        kit_fragments: &[PathBuf],
        config_files: &[PathBuf],
    ) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        let files = self.manifest_file_sequence(workdir.path(), kit_fragments, config_files)?;
        let _guard = ChdirGuard::enter(&self.root)?;
        adaptive_merge(merger, &files, EvalMode::Skip)
    }

    /// First defined value across alternative dotted paths, else the lazily
    /// computed default.
    pub fn param_or(
        &self,
        merger: &dyn Merger,
        paths: &[&str],
        default: impl FnOnce() -> Value,
    ) -> Result<Value> {
        let doc = self.params(merger)?;
        Ok(lookup_first(&doc, paths).cloned().unwrap_or_else(default))
    }
}

fn string_setting(doc: &Value, path: &str, default: &str) -> String {
    lookup(doc, path)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

/// Dotted-path lookup over a document; path segments descend into mappings
/// and numeric segments index into lists.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(list) => list.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn lookup_first<'a>(doc: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths.iter().find_map(|path| lookup(doc, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_and_decomposition() {
        assert!(EnvName::parse("us-east-prod").is_ok());
        assert!(EnvName::parse("Us-east").is_err());
        assert!(EnvName::parse("us--east").is_err());
        assert!(EnvName::parse("us-east-").is_err());
        assert!(EnvName::parse("us east").is_err());
        let name = EnvName::parse("a-b-c-d").unwrap();
        assert_eq!(name.ancestors(), vec!["a", "a-b", "a-b-c", "a-b-c-d"]);
    }

    #[test]
    fn bosh_env_reference_grammar() {
        let plain = BoshEnvRef::parse("prod", "fallback").unwrap();
        assert_eq!(plain.alias, "prod");
        assert_eq!(plain.deployment_type, "bosh");
        assert!(plain.url.is_none() && plain.mount.is_none());

        let typed = BoshEnvRef::parse("prod/vault", "fallback").unwrap();
        assert_eq!(typed.deployment_type, "vault");

        let mounted = BoshEnvRef::parse("prod@secret/exodus", "fallback").unwrap();
        assert_eq!(mounted.mount.as_deref(), Some("secret/exodus"));
        assert!(mounted.url.is_none());

        let full = BoshEnvRef::parse("prod/bosh@https://vault:8200/secret/exodus", "fallback").unwrap();
        assert_eq!(full.url.as_deref(), Some("https://vault:8200"));
        assert_eq!(full.mount.as_deref(), Some("secret/exodus"));

        let empty = BoshEnvRef::parse("", "fallback").unwrap();
        assert_eq!(empty.alias, "fallback");
    }

    #[test]
    fn dotted_lookup_descends_maps_and_lists() {
        let doc: Value = serde_yaml_bw::from_str(
            r#"
params:
  networks:
    - name: default
      range: 10.0.0.0/24
"#,
        )
        .unwrap();
        assert_eq!(
            lookup(&doc, "params.networks.0.range").and_then(Value::as_str),
            Some("10.0.0.0/24")
        );
        assert!(lookup(&doc, "params.networks.1").is_none());
        assert_eq!(
            lookup_first(&doc, &["params.absent", "params.networks.0.name"])
                .and_then(Value::as_str),
            Some("default")
        );
    }
}
