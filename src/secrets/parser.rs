use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{GenesisError, Result};
use crate::secrets::plan::{
    DhparamsPlan, ErrorPlan, KeyPlan, KNOWN_USAGES, RandomPlan, SecretPlan, X509Plan,
};

static RANDOM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^random\s+([1-9][0-9]*)(?:\s+fmt\s+(\S+)(?:\s+at\s+(\S+))?)?(?:\s+allowed-chars\s+(\S+))?(\s+fixed)?$",
    )
    .unwrap()
});
static SSH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ssh\s+([1-9][0-9]*)(\s+fixed)?$").unwrap());
static RSA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^rsa\s+([1-9][0-9]*)(\s+fixed)?$").unwrap());
static DHPARAMS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dhparams?\s+([1-9][0-9]*)(\s+fixed)?$").unwrap());
static VALID_FOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9][0-9]*[ymdh]$").unwrap());

const KEY_SIZE_MIN: u32 = 1024;
const KEY_SIZE_MAX: u32 = 16384;

/// Options applied while converting kit metadata into plans.
#[derive(Debug, Default, Clone)]
pub struct ParseOptions {
    /// Absolute store path of a shared root CA; unsigned plans chain to it.
    pub root_ca_path: Option<String>,
    /// When false, field-level checks are skipped (e.g. for `remove`, where
    /// a malformed declaration should not block cleanup).
    pub validate: bool,
    /// Slash-delimited path filter, `!`-negatable, `i` for case folding.
    pub filter: Option<String>,
}

impl ParseOptions {
    pub fn new() -> Self {
        Self {
            root_ca_path: None,
            validate: true,
            filter: None,
        }
    }
}

/// Flatten the `certificates.<feature>` and `credentials.<feature>` subtrees
/// of the kit metadata into one plan per unique credential path. Syntactic
/// problems become `error` plans at the offending path; only an invalid
/// filter aborts parsing.
pub fn parse(metadata: &Value, features: &[String], options: &ParseOptions) -> Result<Vec<SecretPlan>> {
    let mut plans: IndexMap<String, SecretPlan> = IndexMap::new();

    let mut walk_features: Vec<&str> = vec!["base"];
    for feature in features {
        if feature != "base" {
            walk_features.push(feature);
        }
    }

    for feature in &walk_features {
        if let Some(certs) = metadata.get("certificates").and_then(|c| c.get(feature)) {
            parse_certificates(certs, options, &mut plans);
        }
        if let Some(creds) = metadata.get("credentials").and_then(|c| c.get(feature)) {
            parse_credentials(creds, &mut plans);
        }
    }

    let mut sequence: Vec<SecretPlan> = plans.into_values().collect();
    if let Some(pattern) = options.filter.as_deref() {
        let filter = PathFilter::parse(pattern)?;
        sequence.retain(|plan| filter.matches(&plan.path()));
    }
    Ok(sequence)
}

fn parse_certificates(tree: &Value, options: &ParseOptions, plans: &mut IndexMap<String, SecretPlan>) {
    let Some(groups) = tree.as_object() else {
        return;
    };
    for (base_path, group) in groups {
        let Some(entries) = group.as_object() else {
            insert_error(
                plans,
                base_path,
                "certificate group must be a map of name to specification",
            );
            continue;
        };
        for (leaf, spec) in entries {
            let path = format!("{base_path}/{leaf}");
            if path.contains(':') {
                insert_error(plans, &path, "certificate paths must not contain ':'");
                continue;
            }
            let plan = parse_x509(&path, base_path, spec, options);
            plans.insert(path, plan);
        }
    }
}

fn parse_x509(path: &str, base_path: &str, spec: &Value, options: &ParseOptions) -> SecretPlan {
    let Some(fields) = spec.as_object() else {
        return error_plan(path, "certificate specification must be a map");
    };
    let mut plan = X509Plan::new(path, base_path);
    plan.is_ca = fields.get("is_ca").and_then(Value::as_bool).unwrap_or(false);

    if let Some(signed_by) = fields.get("signed_by") {
        let Some(signer) = signed_by.as_str().filter(|s| !s.is_empty()) else {
            return error_plan(path, "signed_by must be a non-empty string");
        };
        if signer.starts_with("base.") {
            // One-shot legacy form from old kits; surfaced, never rewritten.
            return error_plan(
                path,
                &format!(
                    "signed_by '{signer}' uses the retired dotted form; declare the CA path with slashes"
                ),
            );
        }
        if let Some(abs) = signer.strip_prefix('/') {
            plan.signed_by = Some(abs.to_string());
            plan.signed_by_abs_path = true;
        } else {
            plan.signed_by = Some(signer.to_string());
        }
    }

    if let Some(names) = fields.get("names") {
        let Some(list) = names.as_array() else {
            return error_plan(path, "names must be a list");
        };
        for name in list {
            match name.as_str() {
                Some(n) if !n.trim().is_empty() => plan.names.push(n.to_string()),
                _ => return error_plan(path, "subject names must be non-empty strings"),
            }
        }
    }

    if let Some(usage) = fields.get("usage") {
        let Some(list) = usage.as_array() else {
            return error_plan(path, "usage must be a list");
        };
        let mut tokens = Vec::new();
        for entry in list {
            let Some(token) = entry.as_str() else {
                return error_plan(path, "usage entries must be strings");
            };
            if options.validate && !KNOWN_USAGES.contains(&token) {
                return error_plan(path, &format!("unknown key usage '{token}'"));
            }
            tokens.push(token.to_string());
        }
        plan.usage = Some(tokens);
    }

    if let Some(valid_for) = fields.get("valid_for") {
        let ttl = match valid_for {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return error_plan(path, "valid_for must be a duration like 2y or 90d"),
        };
        if options.validate && !VALID_FOR_RE.is_match(&ttl) {
            return error_plan(
                path,
                &format!("valid_for '{ttl}' must match <positive integer><y|m|d|h>"),
            );
        }
        plan.valid_for = Some(ttl);
    }

    SecretPlan::X509(plan)
}

fn parse_credentials(tree: &Value, plans: &mut IndexMap<String, SecretPlan>) {
    let Some(entries) = tree.as_object() else {
        return;
    };
    for (path, spec) in entries {
        if path.contains(':') {
            insert_error(plans, path, "credential paths must not contain ':'");
            continue;
        }
        match spec {
            Value::String(command) => {
                let plan = parse_path_credential(path, command);
                plans.insert(path.clone(), plan);
            }
            Value::Object(keys) => {
                for (key, value) in keys {
                    let keyed_path = format!("{path}:{key}");
                    if key.contains(':') {
                        insert_error(plans, &keyed_path, "credential keys must not contain ':'");
                        continue;
                    }
                    let plan = match value.as_str() {
                        Some(command) => parse_keyed_credential(path, key, command),
                        None => error_plan(&keyed_path, "credential specification must be a string"),
                    };
                    plans.insert(keyed_path, plan);
                }
            }
            _ => {
                insert_error(
                    plans,
                    path,
                    "credential specification must be a string or a map of keys",
                );
            }
        }
    }
}

/// Credential declared directly at a path: ssh/rsa/dhparams forms only.
fn parse_path_credential(path: &str, command: &str) -> SecretPlan {
    let command = command.trim();
    if let Some(caps) = SSH_RE.captures(command) {
        return keypair_plan(path, &caps, SecretPlan::Ssh);
    }
    if let Some(caps) = RSA_RE.captures(command) {
        return keypair_plan(path, &caps, SecretPlan::Rsa);
    }
    if let Some(caps) = DHPARAMS_RE.captures(command) {
        let size: u32 = caps[1].parse().unwrap_or(0);
        if !(KEY_SIZE_MIN..=KEY_SIZE_MAX).contains(&size) {
            return error_plan(
                path,
                &format!("dhparams size {size} outside {KEY_SIZE_MIN}..{KEY_SIZE_MAX}"),
            );
        }
        return SecretPlan::Dhparams(DhparamsPlan {
            path: path.to_string(),
            size,
            fixed: caps.get(2).is_some(),
        });
    }
    if command.starts_with("random") {
        return error_plan(path, "random credentials must be specified per key in a hashmap");
    }
    error_plan(path, &format!("unrecognized credential specification '{command}'"))
}

/// Credential declared under `path: key:`; only the random form is legal.
fn parse_keyed_credential(path: &str, key: &str, command: &str) -> SecretPlan {
    let command = command.trim();
    if let Some(caps) = RANDOM_RE.captures(command) {
        let size: u32 = caps[1].parse().unwrap_or(0);
        return SecretPlan::Random(RandomPlan {
            path: path.to_string(),
            key: key.to_string(),
            size,
            format: caps.get(2).map(|m| m.as_str().to_string()),
            destination: caps.get(3).map(|m| m.as_str().to_string()),
            valid_chars: caps.get(4).map(|m| m.as_str().to_string()),
            fixed: caps.get(5).is_some(),
        });
    }
    let keyed_path = format!("{path}:{key}");
    if SSH_RE.is_match(command) || RSA_RE.is_match(command) || DHPARAMS_RE.is_match(command) {
        return error_plan(&keyed_path, "only random credentials may be keyed");
    }
    error_plan(
        &keyed_path,
        &format!("unrecognized credential specification '{command}'"),
    )
}

fn keypair_plan(
    path: &str,
    caps: &regex::Captures<'_>,
    build: fn(KeyPlan) -> SecretPlan,
) -> SecretPlan {
    let size: u32 = caps[1].parse().unwrap_or(0);
    if !(KEY_SIZE_MIN..=KEY_SIZE_MAX).contains(&size) {
        return error_plan(
            path,
            &format!("key size {size} outside {KEY_SIZE_MIN}..{KEY_SIZE_MAX}"),
        );
    }
    build(KeyPlan {
        path: path.to_string(),
        size,
        fixed: caps.get(2).is_some(),
    })
}

fn error_plan(path: &str, error: &str) -> SecretPlan {
    SecretPlan::Error(ErrorPlan {
        path: path.to_string(),
        error: error.to_string(),
    })
}

fn insert_error(plans: &mut IndexMap<String, SecretPlan>, path: &str, error: &str) {
    plans.insert(path.to_string(), error_plan(path, error));
}

/// Slash-delimited path filter with negation and case-insensitivity:
/// `/tls/`, `!/tls/`, `/TLS/i`.
struct PathFilter {
    regex: Regex,
    negate: bool,
}

impl PathFilter {
    fn parse(pattern: &str) -> Result<Self> {
        let (negate, rest) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let rest = rest.strip_prefix('/').ok_or_else(|| {
            GenesisError::Config(format!("filter '{pattern}' must be slash-delimited"))
        })?;
        let (body, insensitive) = match rest.strip_suffix("/i") {
            Some(body) => (body, true),
            None => (
                rest.strip_suffix('/').ok_or_else(|| {
                    GenesisError::Config(format!("filter '{pattern}' must be slash-delimited"))
                })?,
                false,
            ),
        };
        let source = if insensitive {
            format!("(?i){body}")
        } else {
            body.to_string()
        };
        let regex = Regex::new(&source)
            .map_err(|err| GenesisError::Config(format!("invalid filter '{pattern}': {err}")))?;
        Ok(Self { regex, negate })
    }

    fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path) != self.negate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::plan::SelfSigned;

    fn meta(yaml: &str) -> Value {
        serde_yaml_bw::from_str(yaml).expect("metadata parses")
    }

    fn parse_all(yaml: &str, features: &[&str]) -> Vec<SecretPlan> {
        let features: Vec<String> = features.iter().map(|f| f.to_string()).collect();
        parse(&meta(yaml), &features, &ParseOptions::new()).expect("parse succeeds")
    }

    #[test]
    fn parses_certificates_with_base_path() {
        let plans = parse_all(
            r#"
certificates:
  base:
    tls:
      ca: { is_ca: true, valid_for: 10y }
      server:
        names: [api.example.com, "10.0.0.1"]
        usage: [server_auth]
"#,
            &[],
        );
        assert_eq!(plans.len(), 2);
        let SecretPlan::X509(ca) = &plans[0] else {
            panic!("expected x509, got {:?}", plans[0]);
        };
        assert_eq!(ca.path, "tls/ca");
        assert_eq!(ca.base_path, "tls");
        assert!(ca.is_ca);
        assert_eq!(ca.self_signed, SelfSigned::No);
        let SecretPlan::X509(server) = &plans[1] else {
            panic!("expected x509");
        };
        assert_eq!(server.cn(), Some("api.example.com"));
        assert_eq!(server.sans(), ["10.0.0.1".to_string()]);
    }

    #[test]
    fn parses_credential_grammar() {
        let plans = parse_all(
            r#"
credentials:
  base:
    app/ssh: ssh 2048 fixed
    app/signing: rsa 4096
    app/dh: dhparams 2048
    app/users:
      admin: random 32 fmt crypt-sha512 at admin-crypt
      token: random 16 allowed-chars a-z0-9 fixed
"#,
            &[],
        );
        assert_eq!(plans.len(), 5);
        assert!(matches!(&plans[0], SecretPlan::Dhparams(p) if p.size == 2048));
        assert!(matches!(&plans[1], SecretPlan::Rsa(p) if p.size == 4096 && !p.fixed));
        assert!(matches!(&plans[2], SecretPlan::Ssh(p) if p.size == 2048 && p.fixed));
        let SecretPlan::Random(admin) = &plans[3] else {
            panic!("expected random");
        };
        assert_eq!(admin.format.as_deref(), Some("crypt-sha512"));
        assert_eq!(admin.destination.as_deref(), Some("admin-crypt"));
        assert_eq!(admin.formatted_key().as_deref(), Some("admin-crypt"));
        let SecretPlan::Random(token) = &plans[4] else {
            panic!("expected random");
        };
        assert_eq!(token.valid_chars.as_deref(), Some("a-z0-9"));
        assert!(token.fixed);
    }

    #[test]
    fn path_level_random_is_an_error() {
        let plans = parse_all(
            r#"
credentials:
  base:
    app/bad: random 32
"#,
            &[],
        );
        let SecretPlan::Error(err) = &plans[0] else {
            panic!("expected error plan");
        };
        assert!(err.error.contains("per key in a hashmap"), "{}", err.error);
    }

    #[test]
    fn feature_subtrees_join_base() {
        let plans = parse_all(
            r#"
credentials:
  base:
    app/core: rsa 2048
  ha:
    app/ha: ssh 2048
"#,
            &["ha"],
        );
        let paths: Vec<String> = plans.iter().map(|p| p.path()).collect();
        assert_eq!(paths, vec!["app/core", "app/ha"]);
    }

    #[test]
    fn legacy_dotted_signed_by_is_flagged() {
        let plans = parse_all(
            r#"
certificates:
  base:
    certs:
      server: { signed_by: base.application/certs.ca }
"#,
            &[],
        );
        let SecretPlan::Error(err) = &plans[0] else {
            panic!("expected error plan");
        };
        assert!(err.error.contains("retired dotted form"), "{}", err.error);
    }

    #[test]
    fn filter_selects_and_negates() {
        let yaml = r#"
credentials:
  base:
    tls/key: rsa 2048
    db/key: rsa 2048
"#;
        let features: Vec<String> = Vec::new();
        let mut options = ParseOptions::new();
        options.filter = Some("/^tls//".into());
        let plans = parse(&meta(yaml), &features, &options).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].path(), "tls/key");

        options.filter = Some("!/^tls//".into());
        let plans = parse(&meta(yaml), &features, &options).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].path(), "db/key");
    }

    #[test]
    fn bad_sizes_and_unknown_forms_become_error_plans() {
        let plans = parse_all(
            r#"
credentials:
  base:
    app/tiny: rsa 512
    app/what: bcrypt 10
"#,
            &[],
        );
        assert!(matches!(&plans[0], SecretPlan::Error(e) if e.error.contains("outside")));
        assert!(matches!(&plans[1], SecretPlan::Error(e) if e.error.contains("unrecognized")));
    }
}
