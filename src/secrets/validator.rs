use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::process::{Command, Stdio};

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{GenesisError, Result};
use crate::secrets::plan::{SecretPlan, SelfSigned, X509Plan};
use crate::secrets::{CheckSummary, ItemReport, Outcome, ProgressEvent, ProgressSink};
use crate::store::StoreClient;

/// openssl display names for key-usage bits, mapped to plan tokens.
const USAGE_NAMES: &[(&str, &str)] = &[
    ("Digital Signature", "digital_signature"),
    ("Non Repudiation", "non_repudiation"),
    ("Content Commitment", "content_commitment"),
    ("Key Encipherment", "key_encipherment"),
    ("Data Encipherment", "data_encipherment"),
    ("Key Agreement", "key_agreement"),
    ("Certificate Sign", "key_cert_sign"),
    ("CRL Sign", "crl_sign"),
    ("Encipher Only", "encipher_only"),
    ("Decipher Only", "decipher_only"),
    ("TLS Web Server Authentication", "server_auth"),
    ("TLS Web Client Authentication", "client_auth"),
    ("Code Signing", "code_signing"),
    ("E-mail Protection", "email_protection"),
    ("Time Stamping", "timestamping"),
    ("OCSP Signing", "ocsp_signing"),
];

static CN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"CN\s*=\s*([^,/\n]+)").unwrap());
static SYNTH_CA_CN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ca\.n\d{9}\.").unwrap());
static HEX_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:keyid:)?((?:[0-9A-Fa-f]{2}:)+[0-9A-Fa-f]{2})$").unwrap());

/// Fields extracted from one `openssl x509 -text` rendering.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CertInfo {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub subject_key_id: Option<String>,
    pub authority_key_id: Option<String>,
    pub sans: Vec<String>,
    /// Union of key usage and extended key usage, as plan tokens.
    pub usage: BTreeSet<String>,
    pub is_ca: bool,
}

/// Parse the text rendering of a certificate. Pure function so the parser
/// is testable against canned transcripts.
pub fn parse_cert_text(text: &str) -> CertInfo {
    let mut info = CertInfo::default();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();
        if let Some(rest) = line.strip_prefix("Subject:") {
            info.subject_cn = capture_cn(rest);
        } else if let Some(rest) = line.strip_prefix("Issuer:") {
            info.issuer_cn = capture_cn(rest);
        } else if let Some(rest) = line.strip_prefix("Not Before:") {
            info.not_before = parse_openssl_time(rest);
        } else if let Some(rest) = line.strip_prefix("Not After :").or_else(|| line.strip_prefix("Not After:")) {
            info.not_after = parse_openssl_time(rest);
        } else if line.starts_with("X509v3 Subject Key Identifier") {
            info.subject_key_id = next_key_id(&lines, i);
        } else if line.starts_with("X509v3 Authority Key Identifier") {
            info.authority_key_id = next_key_id(&lines, i);
        } else if line.starts_with("X509v3 Subject Alternative Name") {
            if let Some(next) = lines.get(i + 1) {
                for entry in next.split(',') {
                    let entry = entry.trim();
                    let value = entry
                        .strip_prefix("DNS:")
                        .or_else(|| entry.strip_prefix("IP Address:"))
                        .or_else(|| entry.strip_prefix("email:"))
                        .unwrap_or(entry);
                    if !value.is_empty() {
                        info.sans.push(value.to_string());
                    }
                }
                i += 1;
            }
        } else if line.starts_with("X509v3 Key Usage") || line.starts_with("X509v3 Extended Key Usage") {
            if let Some(next) = lines.get(i + 1) {
                for name in next.split(',') {
                    let name = name.trim();
                    if let Some((_, token)) = USAGE_NAMES.iter().find(|(n, _)| *n == name) {
                        info.usage.insert((*token).to_string());
                    }
                }
                i += 1;
            }
        } else if line.starts_with("X509v3 Basic Constraints") {
            if let Some(next) = lines.get(i + 1) {
                if next.trim().starts_with("CA:TRUE") {
                    info.is_ca = true;
                }
            }
        }
        i += 1;
    }
    info
}

fn capture_cn(line: &str) -> Option<String> {
    CN_RE
        .captures(line)
        .map(|caps| caps[1].trim().to_string())
}

fn next_key_id(lines: &[&str], i: usize) -> Option<String> {
    let next = lines.get(i + 1)?.trim();
    HEX_ID_RE
        .captures(next)
        .map(|caps| caps[1].to_ascii_uppercase())
}

/// openssl prints `Mar  1 12:00:00 2024 GMT`; whitespace is collapsed
/// before parsing.
fn parse_openssl_time(text: &str) -> Option<DateTime<Utc>> {
    let normalized = text
        .trim()
        .trim_end_matches("GMT")
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%b %e %H:%M:%S %Y"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Certificate and key introspection seam. The default implementation
/// shells out to `openssl` and `ssh-keygen`; tests supply transcripts.
pub trait CryptoInspector {
    fn cert_text(&self, cert_pem: &str) -> Result<String>;
    fn cert_modulus(&self, cert_pem: &str) -> Result<String>;
    fn private_modulus(&self, key_pem: &str) -> Result<String>;
    fn public_modulus(&self, public_pem: &str) -> Result<String>;
    /// Verify `cert_pem` against a CA bundle; Ok(true) when the chain holds.
    fn verify_chain(&self, cert_pem: &str, chain_pem: &str) -> Result<bool>;
    fn ssh_public_from_private(&self, private_pem: &str) -> Result<String>;
    fn ssh_key_bits(&self, public_key: &str) -> Result<u32>;
}

pub struct OpensslInspector;

impl OpensslInspector {
    fn openssl(&self, args: &[&str], stdin: &str) -> Result<String> {
        let mut child = Command::new("openssl")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    GenesisError::DependencyMissing {
                        binary: "openssl".into(),
                        hint: "required for certificate validation".into(),
                    }
                } else {
                    GenesisError::Io(err)
                }
            })?;
        child
            .stdin
            .as_mut()
            .expect("stdin piped")
            .write_all(stdin.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(GenesisError::Subprocess {
                command: format!("openssl {}", args.join(" ")),
                status: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl CryptoInspector for OpensslInspector {
    fn cert_text(&self, cert_pem: &str) -> Result<String> {
        self.openssl(&["x509", "-noout", "-text", "-fingerprint", "-sha1"], cert_pem)
    }

    fn cert_modulus(&self, cert_pem: &str) -> Result<String> {
        let out = self.openssl(&["x509", "-noout", "-modulus"], cert_pem)?;
        Ok(out.trim().trim_start_matches("Modulus=").to_string())
    }

    fn private_modulus(&self, key_pem: &str) -> Result<String> {
        let out = self.openssl(&["rsa", "-noout", "-modulus"], key_pem)?;
        Ok(out.trim().trim_start_matches("Modulus=").to_string())
    }

    fn public_modulus(&self, public_pem: &str) -> Result<String> {
        let out = self.openssl(&["rsa", "-pubin", "-noout", "-modulus"], public_pem)?;
        Ok(out.trim().trim_start_matches("Modulus=").to_string())
    }

    fn verify_chain(&self, cert_pem: &str, chain_pem: &str) -> Result<bool> {
        let mut bundle = tempfile::NamedTempFile::new()?;
        bundle.write_all(chain_pem.as_bytes())?;
        let path = bundle.path().to_string_lossy().to_string();
        match self.openssl(&["verify", "-CAfile", &path], cert_pem) {
            Ok(out) => Ok(out.contains(": OK")),
            Err(GenesisError::Subprocess { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn ssh_public_from_private(&self, private_pem: &str) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, private_pem)?;
        let output = Command::new("ssh-keygen")
            .arg("-y")
            .arg("-f")
            .arg(&key_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    GenesisError::DependencyMissing {
                        binary: "ssh-keygen".into(),
                        hint: "required for ssh key validation".into(),
                    }
                } else {
                    GenesisError::Io(err)
                }
            })?;
        if !output.status.success() {
            return Err(GenesisError::Subprocess {
                command: "ssh-keygen -y".into(),
                status: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn ssh_key_bits(&self, public_key: &str) -> Result<u32> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("key.pub");
        std::fs::write(&key_path, public_key)?;
        let output = Command::new("ssh-keygen")
            .arg("-l")
            .arg("-f")
            .arg(&key_path)
            .stdin(Stdio::null())
            .output()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.split_whitespace()
            .next()
            .and_then(|bits| bits.parse().ok())
            .ok_or_else(|| GenesisError::Other(format!("unparseable key listing: {text}")))
    }
}

/// Validates materialized secrets against their plans using one pre-loaded
/// store snapshot.
pub struct PlanValidator<'a> {
    store: &'a StoreClient,
    base: String,
    inspector: &'a dyn CryptoInspector,
}

impl<'a> PlanValidator<'a> {
    pub fn new(store: &'a StoreClient, base: &str, inspector: &'a dyn CryptoInspector) -> Self {
        let mut base = base.trim_end_matches('/').to_string();
        if !base.is_empty() {
            base.push('/');
        }
        Self {
            store,
            base,
            inspector,
        }
    }

    fn full_path(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn snapshot(
        &self,
        sink: &mut dyn ProgressSink,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        sink.on_event(ProgressEvent::Wait {
            message: "retrieving store contents",
        });
        let prefix = self.base.trim_end_matches('/').to_string();
        let snapshot = self.store.export(&[prefix])?;
        sink.on_event(ProgressEvent::WaitDone);
        Ok(snapshot)
    }

    /// Presence-only probe: every expected key must exist.
    pub fn check(&self, plans: &[SecretPlan], sink: &mut dyn ProgressSink) -> Result<CheckSummary> {
        self.run("check", plans, sink, |plan, entry| {
            match missing_keys(plan, entry) {
                keys if keys.is_empty() => ItemReport::new(plan.path(), Outcome::Ok, ""),
                keys => ItemReport::new(
                    plan.path(),
                    Outcome::Missing,
                    format!("missing key(s): {}", keys.join(", ")),
                ),
            }
        })
    }

    /// Structural, cryptographic and policy-level validation.
    pub fn validate(&self, plans: &[SecretPlan], sink: &mut dyn ProgressSink) -> Result<CheckSummary> {
        // The snapshot is shared across items; signer lookups walk it too.
        let snapshot = self.snapshot(sink)?;
        let mut summary = CheckSummary::default();
        if plans.is_empty() {
            sink.on_event(ProgressEvent::Empty);
            return Ok(summary);
        }
        sink.on_event(ProgressEvent::Init {
            action: "validate",
            total: plans.len(),
        });
        for (index, plan) in plans.iter().enumerate() {
            sink.on_event(ProgressEvent::StartItem { index, plan });
            let report = self.validate_item(plan, plans, &snapshot);
            summary.record(report.outcome);
            sink.on_event(ProgressEvent::DoneItem {
                index,
                report: &report,
            });
        }
        sink.on_event(ProgressEvent::Completed { summary: &summary });
        Ok(summary)
    }

    fn run(
        &self,
        action: &str,
        plans: &[SecretPlan],
        sink: &mut dyn ProgressSink,
        assess: impl Fn(&SecretPlan, Option<&BTreeMap<String, String>>) -> ItemReport,
    ) -> Result<CheckSummary> {
        let snapshot = self.snapshot(sink)?;
        let mut summary = CheckSummary::default();
        if plans.is_empty() {
            sink.on_event(ProgressEvent::Empty);
            return Ok(summary);
        }
        sink.on_event(ProgressEvent::Init {
            action,
            total: plans.len(),
        });
        for (index, plan) in plans.iter().enumerate() {
            sink.on_event(ProgressEvent::StartItem { index, plan });
            let report = match plan {
                SecretPlan::Error(err) => {
                    ItemReport::new(err.path.clone(), Outcome::Error, err.error.clone())
                }
                _ => {
                    let entry = snapshot.get(&self.full_path(plan.base_store_path()));
                    assess(plan, entry)
                }
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

    fn validate_item(
        &self,
        plan: &SecretPlan,
        all: &[SecretPlan],
        snapshot: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> ItemReport {
        if let SecretPlan::Error(err) = plan {
            return ItemReport::new(err.path.clone(), Outcome::Error, err.error.clone());
        }
        let entry = snapshot.get(&self.full_path(plan.base_store_path()));
        let missing = missing_keys(plan, entry);
        if !missing.is_empty() {
            return ItemReport::new(
                plan.path(),
                Outcome::Missing,
                format!("missing key(s): {}", missing.join(", ")),
            );
        }
        let entry = entry.expect("entry present when no keys are missing");
        let result = match plan {
            SecretPlan::X509(p) => self.validate_x509(p, all, snapshot, entry),
            SecretPlan::Rsa(p) => self.validate_rsa(p, entry),
            SecretPlan::Ssh(p) => self.validate_ssh(p, entry),
            SecretPlan::Random(p) => Ok(validate_random(p, entry)),
            SecretPlan::Dhparams(_) => Ok(validate_dhparams(entry)),
            SecretPlan::Error(_) => unreachable!("error plans reported above"),
        };
        match result {
            Ok(assessment) => assessment.into_report(plan.path()),
            Err(err) => ItemReport::new(plan.path(), Outcome::Error, format!("{err}")),
        }
    }

    fn validate_x509(
        &self,
        plan: &X509Plan,
        all: &[SecretPlan],
        snapshot: &BTreeMap<String, BTreeMap<String, String>>,
        entry: &BTreeMap<String, String>,
    ) -> Result<Assessment> {
        let mut assessment = Assessment::default();
        let cert = &entry["certificate"];
        let key = &entry["key"];

        let cert_modulus = self.inspector.cert_modulus(cert)?;
        let key_modulus = self.inspector.private_modulus(key)?;
        if cert_modulus != key_modulus {
            assessment.error("private key does not match certificate");
        }

        let info = parse_cert_text(&self.inspector.cert_text(cert)?);

        match plan.cn() {
            Some(expected) => match info.subject_cn.as_deref() {
                Some(actual) if actual == expected => {}
                Some(actual) => {
                    assessment.error(format!("subject CN is '{actual}', want '{expected}'"))
                }
                None => assessment.error("certificate has no subject CN"),
            },
            None if plan.is_ca => {
                let ok = info
                    .subject_cn
                    .as_deref()
                    .is_some_and(|cn| SYNTH_CA_CN_RE.is_match(cn));
                if !ok {
                    assessment.warn("CA subject CN is not an auto-generated name");
                }
            }
            None => {}
        }

        let expected_sans: BTreeSet<&str> = plan.sans().iter().map(String::as_str).collect();
        let actual_sans: BTreeSet<&str> = info
            .sans
            .iter()
            .map(String::as_str)
            .filter(|san| Some(*san) != plan.cn())
            .collect();
        for missing in expected_sans.difference(&actual_sans) {
            assessment.error(format!("missing SAN '{missing}'"));
        }
        for extra in actual_sans.difference(&expected_sans) {
            assessment.warn(format!("unexpected SAN '{extra}'"));
        }

        if plan.self_signed != SelfSigned::No {
            let self_ok = match (&info.subject_key_id, &info.authority_key_id) {
                (Some(ski), Some(aki)) => ski == aki,
                _ => info.subject_cn.is_some() && info.subject_cn == info.issuer_cn,
            };
            if !self_ok {
                assessment.error("expected a self-signed certificate");
            }
        } else if let Some(signer) = &plan.signed_by {
            let signer_full = if plan.signed_by_abs_path {
                signer.clone()
            } else {
                self.full_path(signer)
            };
            self.check_signer(plan, cert, &info, &signer_full, all, snapshot, &mut assessment)?;
        }

        if info.is_ca != plan.is_ca {
            assessment.error(if plan.is_ca {
                "certificate is not a CA"
            } else {
                "certificate is unexpectedly a CA"
            });
        }

        let now = Utc::now();
        match (info.not_before, info.not_after) {
            (Some(nbf), _) if nbf > now => {
                assessment.error(format!("not valid until {nbf}"));
            }
            (_, Some(exp)) if exp < now => {
                assessment.error(format!("expired {} days ago", (now - exp).num_days()));
            }
            (_, Some(exp)) => {
                assessment.note(format!("expires in {} days", (exp - now).num_days()));
            }
            _ => assessment.warn("could not read validity window"),
        }

        let expected_usage = normalize_usage(plan.effective_usage().iter().copied());
        let actual_usage = normalize_usage(info.usage.iter().map(String::as_str));
        for missing in expected_usage.difference(&actual_usage) {
            assessment.error(format!("missing key usage '{missing}'"));
        }
        for extra in actual_usage.difference(&expected_usage) {
            assessment.warn(format!("extra key usage '{extra}'"));
        }

        Ok(assessment)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_signer(
        &self,
        plan: &X509Plan,
        cert: &str,
        info: &CertInfo,
        signer_full: &str,
        all: &[SecretPlan],
        snapshot: &BTreeMap<String, BTreeMap<String, String>>,
        assessment: &mut Assessment,
    ) -> Result<()> {
        let signer_cert = match snapshot.get(signer_full).and_then(|e| e.get("certificate")) {
            Some(cert) => Some(cert.clone()),
            None => self.store.get(signer_full)?.remove("certificate"),
        };

        if let (Some(aki), Some(signer_cert)) = (&info.authority_key_id, &signer_cert) {
            let signer_info = parse_cert_text(&self.inspector.cert_text(signer_cert)?);
            if let Some(ski) = &signer_info.subject_key_id {
                if aki != ski {
                    assessment.error(format!("not signed by {signer_full}"));
                }
                return Ok(());
            }
        }

        // Key identifiers unavailable; build the chain across the plan set.
        if let Some(chain) = self.signer_chain(plan, all, snapshot) {
            debug!(path = %plan.path, "verifying signature via constructed chain");
            if !self.inspector.verify_chain(cert, &chain)? {
                assessment.error(format!("chain verification against {signer_full} failed"));
            }
            return Ok(());
        }

        // Last resort: ask the store itself.
        let args = vec![
            "x509".to_string(),
            "validate".to_string(),
            "--signed-by".to_string(),
            signer_full.to_string(),
            self.full_path(&plan.path),
        ];
        let out = self.store.query(&args)?;
        if !out.success() {
            assessment.error(format!("not signed by {signer_full}"));
        }
        Ok(())
    }

    /// Concatenated signer certificates, walking `signed_by` from this plan
    /// to a root. None when any link is missing from the snapshot.
    fn signer_chain(
        &self,
        plan: &X509Plan,
        all: &[SecretPlan],
        snapshot: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Option<String> {
        let mut chain = String::new();
        let mut current = plan.signer_plan_path().map(str::to_string);
        let mut hops = 0;
        while let Some(path) = current {
            if hops > all.len() {
                return None;
            }
            hops += 1;
            let cert = snapshot
                .get(&self.full_path(&path))
                .and_then(|entry| entry.get("certificate"))?;
            chain.push_str(cert);
            if !chain.ends_with('\n') {
                chain.push('\n');
            }
            let next = all.iter().find_map(|candidate| match candidate {
                SecretPlan::X509(p) if p.path == path => p.signer_plan_path().map(str::to_string),
                _ => None,
            });
            current = next;
        }
        if chain.is_empty() { None } else { Some(chain) }
    }

    fn validate_rsa(&self, plan: &crate::secrets::plan::KeyPlan, entry: &BTreeMap<String, String>) -> Result<Assessment> {
        let mut assessment = Assessment::default();
        let private = self.inspector.private_modulus(&entry["private"])?;
        let public = self.inspector.public_modulus(&entry["public"])?;
        if private != public {
            assessment.error("public key does not match private key");
        }
        let bits = (private.trim().len() as u32) * 4;
        if bits != plan.size {
            assessment.error(format!("key is {bits} bits, want {}", plan.size));
        }
        Ok(assessment)
    }

    fn validate_ssh(&self, plan: &crate::secrets::plan::KeyPlan, entry: &BTreeMap<String, String>) -> Result<Assessment> {
        let mut assessment = Assessment::default();
        let derived = self.inspector.ssh_public_from_private(&entry["private"])?;
        if !same_ssh_public(&derived, &entry["public"]) {
            assessment.error("public key does not match private key");
        }
        let bits = self.inspector.ssh_key_bits(&entry["public"])?;
        if bits != plan.size {
            assessment.error(format!("key is {bits} bits, want {}", plan.size));
        }
        Ok(assessment)
    }
}

/// The signature blob (first two fields) identifies an ssh public key; the
/// trailing comment is irrelevant.
fn same_ssh_public(a: &str, b: &str) -> bool {
    let sig = |s: &str| {
        s.split_whitespace()
            .take(2)
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    sig(a) == sig(b)
}

fn validate_random(plan: &crate::secrets::plan::RandomPlan, entry: &BTreeMap<String, String>) -> Assessment {
    let mut assessment = Assessment::default();
    let value = &entry[&plan.key];
    if value.chars().count() != plan.size as usize {
        assessment.error(format!(
            "value is {} characters, want {}",
            value.chars().count(),
            plan.size
        ));
    }
    if let Some(class) = &plan.valid_chars {
        match Regex::new(&format!("^[{class}]*$")) {
            Ok(re) if re.is_match(value) => {}
            Ok(_) => assessment.error(format!("value contains characters outside [{class}]")),
            Err(_) => assessment.warn(format!("unusable character class '{class}'")),
        }
    }
    assessment
}

fn validate_dhparams(entry: &BTreeMap<String, String>) -> Assessment {
    let mut assessment = Assessment::default();
    if !entry["dhparam-pem"].contains("BEGIN DH PARAMETERS") {
        assessment.error("dhparam-pem is not a DH parameters block");
    }
    assessment
}

fn missing_keys(plan: &SecretPlan, entry: Option<&BTreeMap<String, String>>) -> Vec<String> {
    plan.expected_keys()
        .into_iter()
        .filter(|key| !entry.is_some_and(|e| e.contains_key(key)))
        .collect()
}

/// Usage sets compare with `non_repudiation` and `content_commitment`
/// folded together; either one satisfies the other.
fn normalize_usage<'a>(tokens: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    tokens
        .map(|token| {
            if token == "content_commitment" {
                "non_repudiation".to_string()
            } else {
                token.to_string()
            }
        })
        .collect()
}

/// Accumulated findings for one item; the worst class wins.
#[derive(Debug, Default)]
struct Assessment {
    errors: Vec<String>,
    warnings: Vec<String>,
    notes: Vec<String>,
}

impl Assessment {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }

    fn into_report(self, path: String) -> ItemReport {
        let outcome = if !self.errors.is_empty() {
            Outcome::Error
        } else if !self.warnings.is_empty() {
            Outcome::Warn
        } else {
            Outcome::Ok
        };
        let detail: Vec<String> = self
            .errors
            .into_iter()
            .chain(self.warnings)
            .chain(self.notes)
            .collect();
        ItemReport::new(path, outcome, detail.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_CERT_TEXT: &str = r#"Certificate:
    Data:
        Version: 3 (0x2)
        Serial Number: 4660 (0x1234)
        Issuer: CN = ca.n123456789.tls
        Validity
            Not Before: Jan  1 00:00:00 2020 GMT
            Not After : Jan  1 00:00:00 2048 GMT
        Subject: CN = api.example
        X509v3 extensions:
            X509v3 Basic Constraints:
                CA:FALSE
            X509v3 Key Usage: critical
                Digital Signature
            X509v3 Extended Key Usage:
                TLS Web Server Authentication, TLS Web Client Authentication
            X509v3 Subject Key Identifier:
                AA:BB:CC:DD
            X509v3 Authority Key Identifier:
                keyid:11:22:33:44
            X509v3 Subject Alternative Name:
                DNS:api.example, DNS:alt.example, IP Address:10.0.0.1
SHA1 Fingerprint=DE:AD:BE:EF
"#;

    #[test]
    fn parses_openssl_text_rendering() {
        let info = parse_cert_text(SERVER_CERT_TEXT);
        assert_eq!(info.subject_cn.as_deref(), Some("api.example"));
        assert_eq!(info.issuer_cn.as_deref(), Some("ca.n123456789.tls"));
        assert_eq!(info.subject_key_id.as_deref(), Some("AA:BB:CC:DD"));
        assert_eq!(info.authority_key_id.as_deref(), Some("11:22:33:44"));
        assert_eq!(
            info.sans,
            vec!["api.example", "alt.example", "10.0.0.1"]
        );
        assert!(!info.is_ca);
        assert!(info.usage.contains("server_auth"));
        assert!(info.usage.contains("client_auth"));
        assert!(info.usage.contains("digital_signature"));
        assert!(info.not_before.unwrap() < info.not_after.unwrap());
    }

    #[test]
    fn usage_normalization_folds_equivalent_bits() {
        let a = normalize_usage(["content_commitment", "crl_sign"].into_iter());
        let b = normalize_usage(["non_repudiation", "crl_sign"].into_iter());
        assert_eq!(a, b);
    }

    #[test]
    fn ssh_public_comparison_ignores_comment() {
        assert!(same_ssh_public(
            "ssh-rsa AAAAB3Nza generated-key",
            "ssh-rsa AAAAB3Nza someone@host"
        ));
        assert!(!same_ssh_public("ssh-rsa AAAA x", "ssh-rsa BBBB x"));
    }

    #[test]
    fn random_value_checks_length_and_class() {
        let plan = crate::secrets::plan::RandomPlan {
            path: "app/users".into(),
            key: "pass".into(),
            size: 8,
            format: None,
            destination: None,
            valid_chars: Some("a-z".into()),
            fixed: false,
        };
        let mut entry = BTreeMap::new();
        entry.insert("pass".to_string(), "abcdefgh".to_string());
        let report = validate_random(&plan, &entry).into_report("app/users:pass".into());
        assert_eq!(report.outcome, Outcome::Ok);

        entry.insert("pass".to_string(), "abcd1234".to_string());
        let report = validate_random(&plan, &entry).into_report("app/users:pass".into());
        assert_eq!(report.outcome, Outcome::Error);
        assert!(report.detail.contains("outside"), "{}", report.detail);
    }

    #[test]
    fn missing_keys_reports_expected_set() {
        let mut ca = X509Plan::new("tls/ca", "tls");
        ca.is_ca = true;
        let plan = SecretPlan::X509(ca);
        let mut entry = BTreeMap::new();
        entry.insert("certificate".to_string(), "pem".to_string());
        entry.insert("key".to_string(), "pem".to_string());
        let missing = missing_keys(&plan, Some(&entry));
        assert_eq!(missing, vec!["combined", "crl", "serial"]);
        assert_eq!(missing_keys(&plan, None).len(), 5);
    }
}
