use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{GenesisError, Result};
use crate::store::CliOutput;

const CANDIDATE_BINARIES: &[&str] = &["bosh", "bosh2", "boshv2"];

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.\d+\.\d+)").unwrap());

/// Subprocess seam over the director CLI.
pub trait BoshRunner: Send + Sync {
    fn run(
        &self,
        connection: &BTreeMap<String, String>,
        args: &[String],
        capture: bool,
    ) -> Result<CliOutput>;
}

pub struct DefaultBoshRunner {
    binary: PathBuf,
    pub version: Version,
}

impl DefaultBoshRunner {
    /// Probe the candidate binaries and keep the highest compatible one.
    pub fn discover(minimum: &Version) -> Result<Self> {
        let mut found = Vec::new();
        for candidate in CANDIDATE_BINARIES {
            let Ok(path) = which::which(candidate) else {
                continue;
            };
            if let Some(version) = probe_version(&path) {
                debug!("found {} version {version}", path.display());
                found.push((path, version));
            }
        }
        let (binary, version) = pick_binary(found, minimum)?;
        info!("using {} ({version})", binary.display());
        Ok(Self { binary, version })
    }
}

fn probe_version(binary: &Path) -> Option<Version> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    VERSION_RE
        .captures(&text)
        .and_then(|caps| Version::parse(&caps[1]).ok())
}

/// Highest version wins; an incompatible-only field is a version error and
/// an empty field a missing dependency.
fn pick_binary(
    mut found: Vec<(PathBuf, Version)>,
    minimum: &Version,
) -> Result<(PathBuf, Version)> {
    if found.is_empty() {
        return Err(GenesisError::DependencyMissing {
            binary: "bosh".into(),
            hint: "install the BOSH CLI (https://bosh.io/docs/cli-v2-install/)".into(),
        });
    }
    found.sort_by(|a, b| a.1.cmp(&b.1));
    let (binary, version) = found.pop().expect("non-empty candidate list");
    if &version < minimum {
        return Err(GenesisError::DependencyVersion {
            binary: binary.display().to_string(),
            found: version.to_string(),
            minimum: minimum.to_string(),
        });
    }
    Ok((binary, version))
}

impl BoshRunner for DefaultBoshRunner {
    fn run(
        &self,
        connection: &BTreeMap<String, String>,
        args: &[String],
        capture: bool,
    ) -> Result<CliOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args).envs(connection).stdin(Stdio::null());
        debug!(args = ?args, "bosh");
        if capture {
            let output = command.output()?;
            Ok(CliOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            let status = command.status()?;
            Ok(CliOutput {
                status: status.code(),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct BoshTables {
    #[serde(rename = "Tables", default)]
    tables: Vec<BoshTable>,
}

#[derive(Debug, Deserialize)]
struct BoshTable {
    #[serde(rename = "Rows", default)]
    rows: Vec<serde_json::Map<String, Value>>,
}

fn parse_rows(json: &str) -> Result<Vec<serde_json::Map<String, Value>>> {
    let tables: BoshTables = serde_json::from_str(json)?;
    Ok(tables.tables.into_iter().flat_map(|t| t.rows).collect())
}

fn row_str(row: &serde_json::Map<String, Value>, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stemcell {
    pub name: String,
    pub os: String,
    pub version: String,
}

/// A director session: connection env plus the CLI seam. The connection
/// variables come from the deploying director's Exodus record.
pub struct BoshDriver {
    runner: Arc<dyn BoshRunner>,
    pub alias: String,
    connection: BTreeMap<String, String>,
}

impl BoshDriver {
    /// Build the connection from an Exodus record of a `bosh`-type deploy.
    pub fn from_exodus(
        alias: &str,
        exodus: &BTreeMap<String, String>,
        runner: Arc<dyn BoshRunner>,
    ) -> Result<Self> {
        let mut connection = BTreeMap::new();
        let url = exodus.get("url").ok_or_else(|| GenesisError::Deploy {
            env: alias.to_string(),
            detail: "director Exodus record has no url; was it deployed with this toolchain?".into(),
        })?;
        connection.insert("BOSH_ENVIRONMENT".into(), url.clone());
        if let Some(ca) = exodus.get("ca_cert") {
            connection.insert("BOSH_CA_CERT".into(), ca.clone());
        }
        if let Some(client) = exodus.get("admin_username") {
            connection.insert("BOSH_CLIENT".into(), client.clone());
        }
        if let Some(secret) = exodus.get("admin_password") {
            connection.insert("BOSH_CLIENT_SECRET".into(), secret.clone());
        }
        Ok(Self {
            runner,
            alias: alias.to_string(),
            connection,
        })
    }

    /// Local bootstrap mode: no director connection at all.
    pub fn local(runner: Arc<dyn BoshRunner>) -> Self {
        Self {
            runner,
            alias: "(create-env)".into(),
            connection: BTreeMap::new(),
        }
    }

    pub fn connection_env(&self) -> &BTreeMap<String, String> {
        &self.connection
    }

    pub fn deploy(&self, deployment: &str, manifest: &Path, flags: &[String]) -> Result<()> {
        let mut args = vec![
            "-n".to_string(),
            "-d".to_string(),
            deployment.to_string(),
            "deploy".to_string(),
            manifest.display().to_string(),
        ];
        args.extend(flags.iter().cloned());
        let out = self.runner.run(&self.connection, &args, false)?;
        self.expect_success("deploy", out)
    }

    pub fn create_env(
        &self,
        manifest: &Path,
        state_file: &Path,
        vars_file: Option<&Path>,
        flags: &[String],
    ) -> Result<()> {
        let mut args = vec![
            "create-env".to_string(),
            "--state".to_string(),
            state_file.display().to_string(),
        ];
        if let Some(vars) = vars_file {
            args.push("--vars-file".into());
            args.push(vars.display().to_string());
        }
        args.extend(flags.iter().cloned());
        args.push(manifest.display().to_string());
        let out = self.runner.run(&self.connection, &args, false)?;
        self.expect_success("create-env", out)
    }

    /// Known configs of a type, as `(type, name)` pairs.
    pub fn configs(&self, config_type: &str) -> Result<Vec<(String, String)>> {
        let args = vec![
            "configs".to_string(),
            "--type".to_string(),
            config_type.to_string(),
            "--json".to_string(),
        ];
        let out = self.runner.run(&self.connection, &args, true)?;
        if !out.success() {
            return Err(self.failure("configs", out));
        }
        Ok(parse_rows(&out.stdout)?
            .iter()
            .map(|row| (row_str(row, "type"), row_str(row, "name")))
            .filter(|(t, _)| !t.is_empty())
            .collect())
    }

    /// Content of one named config.
    pub fn download_config(&self, config_type: &str, name: &str) -> Result<String> {
        let args = vec![
            "config".to_string(),
            "--type".to_string(),
            config_type.to_string(),
            "--name".to_string(),
            name.to_string(),
            "--json".to_string(),
        ];
        let out = self.runner.run(&self.connection, &args, true)?;
        if !out.success() {
            return Err(self.failure("config", out));
        }
        let rows = parse_rows(&out.stdout)?;
        rows.first()
            .map(|row| row_str(row, "content"))
            .filter(|content| !content.is_empty())
            .ok_or_else(|| GenesisError::Deploy {
                env: self.alias.clone(),
                detail: format!("director returned no {config_type}/{name} config"),
            })
    }

    pub fn stemcells(&self) -> Result<Vec<Stemcell>> {
        let args = vec!["stemcells".to_string(), "--json".to_string()];
        let out = self.runner.run(&self.connection, &args, true)?;
        if !out.success() {
            return Err(self.failure("stemcells", out));
        }
        Ok(parse_rows(&out.stdout)?
            .iter()
            .map(|row| Stemcell {
                name: row_str(row, "name"),
                os: row_str(row, "os"),
                version: row_str(row, "version").trim_end_matches('*').to_string(),
            })
            .filter(|s| !s.name.is_empty() || !s.os.is_empty())
            .collect())
    }

    fn expect_success(&self, op: &str, out: CliOutput) -> Result<()> {
        if out.success() {
            return Ok(());
        }
        Err(self.failure(op, out))
    }

    fn failure(&self, op: &str, out: CliOutput) -> GenesisError {
        GenesisError::Deploy {
            env: self.alias.clone(),
            detail: format!("bosh {op} exited {:?}: {}", out.status, out.combined()),
        }
    }
}

/// Resolve a requested stemcell version (`latest`, `<N>.latest`, or exact)
/// against what the director has uploaded.
pub fn resolve_stemcell<'a>(
    available: &'a [Stemcell],
    os: &str,
    requested: &str,
) -> Option<&'a Stemcell> {
    let of_os: Vec<&Stemcell> = available.iter().filter(|s| s.os == os).collect();
    if requested == "latest" {
        return of_os
            .into_iter()
            .max_by(|a, b| compare_stemcell_versions(&a.version, &b.version));
    }
    if let Some(major) = requested.strip_suffix(".latest") {
        return of_os
            .into_iter()
            .filter(|s| s.version.split('.').next() == Some(major))
            .max_by(|a, b| compare_stemcell_versions(&a.version, &b.version));
    }
    of_os.into_iter().find(|s| s.version == requested)
}

/// Stemcell versions are dotted integers of varying length.
fn compare_stemcell_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_compatible_binary() {
        let found = vec![
            (PathBuf::from("/usr/bin/bosh2"), Version::new(2, 0, 48)),
            (PathBuf::from("/usr/bin/bosh"), Version::new(6, 4, 4)),
        ];
        let (binary, version) = pick_binary(found, &Version::new(2, 0, 0)).unwrap();
        assert_eq!(binary, PathBuf::from("/usr/bin/bosh"));
        assert_eq!(version, Version::new(6, 4, 4));
    }

    #[test]
    fn rejects_outdated_binaries() {
        let found = vec![(PathBuf::from("/usr/bin/bosh"), Version::new(1, 9, 0))];
        let err = pick_binary(found, &Version::new(2, 0, 0)).unwrap_err();
        assert!(matches!(err, GenesisError::DependencyVersion { .. }));
        let err = pick_binary(Vec::new(), &Version::new(2, 0, 0)).unwrap_err();
        assert!(matches!(err, GenesisError::DependencyMissing { .. }));
    }

    #[test]
    fn parses_table_output() {
        let json = r#"{"Tables":[{"Rows":[
            {"type":"cloud","name":"default"},
            {"type":"cloud","name":"dns"}
        ]}]}"#;
        let rows = parse_rows(json).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(row_str(&rows[1], "name"), "dns");
    }

    #[test]
    fn stemcell_resolution_handles_latest_forms() {
        let available = vec![
            Stemcell {
                name: "bosh-stemcell".into(),
                os: "ubuntu-jammy".into(),
                version: "1.29".into(),
            },
            Stemcell {
                name: "bosh-stemcell".into(),
                os: "ubuntu-jammy".into(),
                version: "1.112".into(),
            },
            Stemcell {
                name: "bosh-stemcell".into(),
                os: "ubuntu-bionic".into(),
                version: "621.74".into(),
            },
        ];
        assert_eq!(
            resolve_stemcell(&available, "ubuntu-jammy", "latest").unwrap().version,
            "1.112"
        );
        assert_eq!(
            resolve_stemcell(&available, "ubuntu-jammy", "1.latest").unwrap().version,
            "1.112"
        );
        assert_eq!(
            resolve_stemcell(&available, "ubuntu-bionic", "621.74").unwrap().version,
            "621.74"
        );
        assert!(resolve_stemcell(&available, "ubuntu-jammy", "2.latest").is_none());
        assert!(resolve_stemcell(&available, "centos-7", "latest").is_none());
    }
}
