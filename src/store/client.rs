use std::collections::BTreeMap;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{GenesisError, Result};
use crate::store::registry::StoreTarget;
use crate::store::{CliOutput, SafeRunner};

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?)://([^:/\s]+)(?::(\d+))?$").unwrap());

/// Reachability and auth state of one store session, derived in order:
/// TCP probe, token presence, seal status, handshake path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Unreachable,
    Unauthenticated,
    Sealed,
    Uninitialized,
    Ok,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Unreachable => "unreachable",
            StoreStatus::Unauthenticated => "unauthenticated",
            StoreStatus::Sealed => "sealed",
            StoreStatus::Uninitialized => "uninitialized",
            StoreStatus::Ok => "ok",
        }
    }

    pub fn remedy(&self) -> &'static str {
        match self {
            StoreStatus::Unreachable => "check the store URL and your network path to it",
            StoreStatus::Unauthenticated => "authenticate with `safe auth`",
            StoreStatus::Sealed => "unseal the store before retrying",
            StoreStatus::Uninitialized => "initialize the store mount with `safe set`",
            StoreStatus::Ok => "no action needed",
        }
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store values can come back as strings or integers; integers are coerced
/// to strings so callers see one type.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum SecretValue {
    S(String),
    I(i64),
    B(bool),
}

impl From<SecretValue> for String {
    fn from(value: SecretValue) -> String {
        match value {
            SecretValue::S(s) => s,
            SecretValue::I(i) => i.to_string(),
            SecretValue::B(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionEnv {
    #[serde(default, rename = "VAULT_TOKEN")]
    vault_token: Option<String>,
}

/// One authenticated session against a credentials store, addressed through
/// the external CLI. All operations are blocking subprocess calls.
pub struct StoreClient {
    target: StoreTarget,
    runner: Arc<dyn SafeRunner>,
}

impl StoreClient {
    pub fn new(target: StoreTarget, runner: Arc<dyn SafeRunner>) -> Self {
        Self { target, runner }
    }

    pub fn target(&self) -> &StoreTarget {
        &self.target
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Raw invocation. Always pins the session target and strips debug env.
    pub fn query(&self, args: &[String]) -> Result<CliOutput> {
        self.runner.run(Some(&self.target.name), args, false)
    }

    fn query_args(&self, args: &[&str]) -> Result<CliOutput> {
        let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.query(&owned)
    }

    /// Full key/value map stored at `path`. A missing path is an empty map;
    /// output that is not a mapping is a data-model error.
    pub fn get(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let out = self.query_args(&["export", path])?;
        if !out.success() || out.stdout.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let exported: BTreeMap<String, BTreeMap<String, SecretValue>> =
            serde_json::from_str(&out.stdout).map_err(|_| {
                GenesisError::Other(format!(
                    "unexpected structure exported from {path}: {}",
                    out.stdout.trim()
                ))
            })?;
        let entry = exported
            .into_iter()
            .find(|(k, _)| k == path || k.trim_start_matches('/') == path.trim_start_matches('/'))
            .map(|(_, v)| v)
            .unwrap_or_default();
        Ok(entry
            .into_iter()
            .map(|(k, v)| (k, String::from(v)))
            .collect())
    }

    /// Single value at `path:key`, or None when absent.
    pub fn get_key(&self, path: &str, key: &str) -> Result<Option<String>> {
        let spec = format!("{path}:{key}");
        let out = self.query_args(&["get", &spec])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout.trim_end_matches('\n').to_string()))
    }

    /// Snapshot of every path under each prefix, for validation passes.
    pub fn export(&self, prefixes: &[String]) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let mut args = vec!["export".to_string()];
        args.extend(prefixes.iter().cloned());
        let out = self.query(&args)?;
        if !out.success() || out.stdout.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let exported: BTreeMap<String, BTreeMap<String, SecretValue>> =
            serde_json::from_str(&out.stdout).map_err(|_| {
                GenesisError::Other(format!(
                    "unexpected structure exported from {}",
                    prefixes.join(", ")
                ))
            })?;
        Ok(exported
            .into_iter()
            .map(|(path, keys)| {
                (
                    path,
                    keys.into_iter().map(|(k, v)| (k, String::from(v))).collect(),
                )
            })
            .collect())
    }

    /// Write one key. Without a value the subprocess owns the terminal and
    /// prompts for it.
    pub fn set(&self, path: &str, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                let args = vec![
                    "set".to_string(),
                    path.to_string(),
                    format!("{key}={value}"),
                ];
                let out = self.query(&args)?;
                self.expect_success("set", out)
            }
            None => {
                let args = vec!["set".to_string(), path.to_string(), key.to_string()];
                let out = self.runner.run(Some(&self.target.name), &args, true)?;
                self.expect_success("set", out)
            }
        }
    }

    /// Write every pair in one invocation; used where per-key atomicity of a
    /// whole record matters (Exodus publication).
    pub fn set_many(&self, path: &str, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut args = vec!["set".to_string(), path.to_string()];
        args.extend(pairs.iter().map(|(k, v)| format!("{k}={v}")));
        let out = self.query(&args)?;
        self.expect_success("set", out)
    }

    /// Existence predicate over a path or `path:key`.
    pub fn has(&self, spec: &str) -> Result<bool> {
        let out = self.query_args(&["exists", spec])?;
        Ok(out.success())
    }

    /// Leaf paths under each prefix. When the CLI answers with exactly the
    /// prefix itself, a `has` probe separates "single leaf" from "empty".
    pub fn paths(&self, prefixes: &[String]) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for prefix in prefixes {
            let out = self.query_args(&["paths", prefix])?;
            if !out.success() {
                continue;
            }
            let lines: Vec<String> = out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            if lines.len() == 1 && lines[0] == *prefix {
                if self.has(prefix)? {
                    found.push(prefix.clone());
                }
                continue;
            }
            found.extend(lines);
        }
        Ok(found)
    }

    pub fn rm(&self, path: &str) -> Result<()> {
        let out = self.query_args(&["rm", "-f", path])?;
        self.expect_success("rm", out)
    }

    /// Session state, cheapest check first.
    pub fn status(&self, secrets_mount: &str) -> Result<StoreStatus> {
        if !self.probe_tcp() {
            return Ok(StoreStatus::Unreachable);
        }
        if self.auth_token()?.is_none() {
            return Ok(StoreStatus::Unauthenticated);
        }
        let out = self.query_args(&["status"])?;
        if out.status == Some(2) {
            return Ok(StoreStatus::Sealed);
        }
        let handshake = format!("{}/handshake", secrets_mount.trim_matches('/'));
        if !self.has(&handshake)? {
            return Ok(StoreStatus::Uninitialized);
        }
        Ok(StoreStatus::Ok)
    }

    /// Error carrying the remedial text, for callers that require `ok`.
    pub fn require_ok(&self, secrets_mount: &str) -> Result<()> {
        let status = self.status(secrets_mount)?;
        if status == StoreStatus::Ok {
            return Ok(());
        }
        Err(GenesisError::Store {
            target: self.target.name.clone(),
            state: status.as_str().into(),
            remedy: status.remedy().into(),
        })
    }

    fn auth_token(&self) -> Result<Option<String>> {
        let out = self.query_args(&["env", "--json"])?;
        if !out.success() {
            return Ok(None);
        }
        let env: SessionEnv = serde_json::from_str(&out.stdout).unwrap_or(SessionEnv {
            vault_token: None,
        });
        Ok(env.vault_token.filter(|t| !t.is_empty()))
    }

    fn probe_tcp(&self) -> bool {
        let Some(caps) = URL_RE.captures(&self.target.url) else {
            return false;
        };
        let scheme = &caps[1];
        let host = caps[2].to_string();
        let port: u16 = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let addrs = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => return false,
        };
        for addr in addrs {
            debug!(%addr, "probing store");
            if TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok() {
                return true;
            }
        }
        false
    }

    fn expect_success(&self, op: &str, out: CliOutput) -> Result<()> {
        if out.success() {
            return Ok(());
        }
        Err(GenesisError::Subprocess {
            command: format!("safe {op}"),
            status: out.status,
            output: out.combined(),
        })
    }
}
