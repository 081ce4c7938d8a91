use std::fs;
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde_json::Value;
use tracing::debug;
use crate::env::lookup;
use crate::error::{GenesisError, Result};
use crate::hooks::{ExternalTask, HookEnv, run_task};

/// An unpacked kit: manifest fragments, hook scripts, and the metadata tree
/// declaring required secrets and configs. The metadata is opaque except for
/// the subtrees this engine interprets.
#[derive(Debug)]
pub struct KitRuntime {
    pub name: String,
    pub version: String,
    pub root: PathBuf,
    pub metadata: Value,
}

impl KitRuntime {
    /// Locate the kit for an environment: a `dev/` kit in the repo wins,
    /// otherwise the unpacked copy under `.genesis/kits/`.
    pub fn discover(repo_root: &Path, name: &str, version: Option<&str>) -> Result<Self> {
        let dev = repo_root.join("dev");
        if dev.join("kit.yml").exists() {
            debug!("using dev kit at {}", dev.display());
            return Self::load_dir(&dev);
        }
        let mut candidates = Vec::new();
        if let Some(version) = version {
            candidates.push(repo_root.join(".genesis/kits").join(format!("{name}-{version}")));
            candidates.push(repo_root.join(".genesis/kits").join(name).join(version));
        }
        candidates.push(repo_root.join(".genesis/kits").join(name));
        for candidate in &candidates {
            if candidate.join("kit.yml").exists() {
                return Self::load_dir(candidate);
            }
        }
        Err(GenesisError::Kit(format!(
            "kit {name}{} not found under {} (searched {})",
            version.map(|v| format!("/{v}")).unwrap_or_default(),
            repo_root.join(".genesis/kits").display(),
            candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    pub fn load_dir(dir: &Path) -> Result<Self> {
        let manifest = dir.join("kit.yml");
        let metadata: Value =
            serde_yaml_bw::from_str(&fs::read_to_string(&manifest).map_err(|err| {
                GenesisError::Kit(format!("cannot read {}: {err}", manifest.display()))
            })?)?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".into());
        let version = metadata
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("in-development")
            .to_string();
        Ok(Self {
            name,
            version,
            root: dir.to_path_buf(),
            metadata,
        })
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    /// Merge environment-declared `kit.overrides` over the kit metadata.
    pub fn apply_overrides(&mut self, overrides: &Value) {
        merge_values(&mut self.metadata, overrides);
    }

    pub fn hook_path(&self, hook: &str) -> PathBuf {
        self.root.join("hooks").join(hook)
    }

    pub fn has_hook(&self, hook: &str) -> bool {
        self.hook_path(hook).exists()
    }

    /// Kit compatibility gate for engine features. Absent metadata is
    /// explicitly permissive.
    pub fn feature_compatibility(&self, minimum: &str) -> bool {
        let Some(declared) = self
            .metadata
            .get("genesis_version_min")
            .and_then(Value::as_str)
        else {
            debug!("kit {} declares no genesis_version_min; assuming compatible", self.id());
            return true;
        };
        match (
            Version::parse(declared.trim_start_matches('v')),
            VersionReq::parse(&format!(">={minimum}")),
        ) {
            (Ok(version), Ok(requirement)) => requirement.matches(&version),
            _ => true,
        }
    }

    /// Deployment-time configs the kit requires, as `(type, name)` pairs.
    /// Plain strings mean the default (unnamed) config of that type.
    pub fn required_configs(&self) -> Vec<(String, String)> {
        let Some(list) = lookup(&self.metadata, "genesis.required_configs")
            .or_else(|| self.metadata.get("required_configs"))
            .and_then(Value::as_array)
        else {
            return vec![("cloud".to_string(), "default".to_string())];
        };
        list.iter()
            .filter_map(|entry| match entry {
                Value::String(ctype) => Some((ctype.clone(), "default".to_string())),
                Value::Object(map) => {
                    let ctype = map.get("type").and_then(Value::as_str)?;
                    let name = map
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("default");
                    Some((ctype.to_string(), name.to_string()))
                }
                _ => None,
            })
            .collect()
    }

    /// Final feature list: the kit's features hook may rewrite and extend
    /// the requested set (emitting `+`-prefixed internal features).
    pub fn final_features(
        &self,
        repo_root: &Path,
        requested: &[String],
        hook_env: &HookEnv,
    ) -> Result<Vec<String>> {
        if !self.has_hook("features") {
            return Ok(requested.to_vec());
        }
        let task = ExternalTask::KitHook {
            kit: self,
            hook: "features",
            args: requested.to_vec(),
        };
        let outcome = run_task(&task, repo_root, hook_env, true)?;
        if !outcome.success() {
            return Err(GenesisError::Kit(format!(
                "features hook of kit {} exited {}",
                self.id(),
                outcome.status
            )));
        }
        Ok(outcome
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Manifest fragments for the enabled features. A `blueprint` hook picks
    /// them (opaque ordering); without one, `manifests/base.yml` plus one
    /// fragment per feature.
    pub fn fragment_files(
        &self,
        repo_root: &Path,
        features: &[String],
        hook_env: &HookEnv,
    ) -> Result<Vec<PathBuf>> {
        if self.has_hook("blueprint") {
            let task = ExternalTask::KitHook {
                kit: self,
                hook: "blueprint",
                args: features.to_vec(),
            };
            let outcome = run_task(&task, repo_root, hook_env, true)?;
            if !outcome.success() {
                return Err(GenesisError::Kit(format!(
                    "blueprint hook of kit {} exited {}",
                    self.id(),
                    outcome.status
                )));
            }
            let mut files = Vec::new();
            for line in outcome.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let path = self.root.join(line);
                if !path.exists() {
                    return Err(GenesisError::Kit(format!(
                        "blueprint of kit {} names missing fragment {line}",
                        self.id()
                    )));
                }
                files.push(path);
            }
            return Ok(files);
        }

        let mut files = Vec::new();
        let base = self.root.join("manifests").join("base.yml");
        if base.exists() {
            files.push(base);
        }
        for feature in features {
            let fragment = self
                .root
                .join("manifests")
                .join(format!("{}.yml", feature.trim_start_matches('+')));
            if fragment.exists() {
                files.push(fragment);
            } else {
                debug!("kit {} has no fragment for feature {feature}", self.id());
            }
        }
        if files.is_empty() {
            return Err(GenesisError::Kit(format!(
                "kit {} supplies no manifest fragments",
                self.id()
            )));
        }
        Ok(files)
    }
}

fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay.clone(),
    }
}
