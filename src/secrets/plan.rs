use serde::Serialize;

/// Whether an x509 plan signs itself, and whether the user asked for that
/// or the orderer fell back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfSigned {
    No,
    Implicit,
    Explicit,
}

/// Key-usage tokens accepted in plan declarations and reported by the
/// validator. `non_repudiation` and `content_commitment` are the same bit
/// under two names.
pub const KNOWN_USAGES: &[&str] = &[
    "digital_signature",
    "non_repudiation",
    "content_commitment",
    "key_encipherment",
    "data_encipherment",
    "key_agreement",
    "key_cert_sign",
    "crl_sign",
    "encipher_only",
    "decipher_only",
    "server_auth",
    "client_auth",
    "code_signing",
    "email_protection",
    "timestamping",
    "ocsp_signing",
];

pub const DEFAULT_USAGE: &[&str] = &["server_auth", "client_auth"];
pub const DEFAULT_CA_USAGE: &[&str] = &["server_auth", "client_auth", "crl_sign", "key_cert_sign"];

pub const DEFAULT_CA_TTL: &str = "10y";
pub const DEFAULT_CERT_TTL: &str = "1y";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct X509Plan {
    pub path: String,
    /// Grouping path the plan was declared under; CAs sign within it.
    pub base_path: String,
    pub is_ca: bool,
    pub signed_by: Option<String>,
    /// True when `signed_by` is an absolute store path rather than a
    /// sibling plan path.
    pub signed_by_abs_path: bool,
    pub self_signed: SelfSigned,
    /// First entry is the CN, the rest are SANs.
    pub names: Vec<String>,
    /// None means type defaults apply.
    pub usage: Option<Vec<String>>,
    pub valid_for: Option<String>,
}

impl X509Plan {
    pub fn new(path: &str, base_path: &str) -> Self {
        Self {
            path: path.to_string(),
            base_path: base_path.to_string(),
            is_ca: false,
            signed_by: None,
            signed_by_abs_path: false,
            self_signed: SelfSigned::No,
            names: Vec::new(),
            usage: None,
            valid_for: None,
        }
    }

    pub fn cn(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn sans(&self) -> &[String] {
        if self.names.is_empty() {
            &[]
        } else {
            &self.names[1..]
        }
    }

    pub fn ttl(&self) -> &str {
        match self.valid_for.as_deref() {
            Some(ttl) => ttl,
            None if self.is_ca => DEFAULT_CA_TTL,
            None => DEFAULT_CERT_TTL,
        }
    }

    pub fn effective_usage(&self) -> Vec<&str> {
        match &self.usage {
            Some(usage) => usage.iter().map(String::as_str).collect(),
            None if self.is_ca => DEFAULT_CA_USAGE.to_vec(),
            None => DEFAULT_USAGE.to_vec(),
        }
    }

    /// Sibling plan path this cert must be signed by, when one is expected.
    pub fn signer_plan_path(&self) -> Option<&str> {
        match (&self.signed_by, self.signed_by_abs_path) {
            (Some(signer), false) => Some(signer.as_str()),
            _ => None,
        }
    }
}

/// RSA and SSH keypairs share a shape; the variant carries the difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyPlan {
    pub path: String,
    pub size: u32,
    pub fixed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhparamsPlan {
    pub path: String,
    pub size: u32,
    pub fixed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RandomPlan {
    pub path: String,
    pub key: String,
    pub size: u32,
    pub format: Option<String>,
    /// Key the formatted copy is stored under; defaults to `<key>-<format>`.
    pub destination: Option<String>,
    pub valid_chars: Option<String>,
    pub fixed: bool,
}

impl RandomPlan {
    pub fn formatted_key(&self) -> Option<String> {
        let format = self.format.as_deref()?;
        Some(
            self.destination
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.key, format)),
        )
    }
}

/// A plan that failed parsing or ordering, kept in sequence so the run can
/// surface it as one failed item without dropping the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPlan {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretPlan {
    X509(X509Plan),
    Rsa(KeyPlan),
    Ssh(KeyPlan),
    Dhparams(DhparamsPlan),
    Random(RandomPlan),
    Error(ErrorPlan),
}

impl SecretPlan {
    /// Store path of the credential, including the `:key` component for
    /// random plans.
    pub fn path(&self) -> String {
        match self {
            SecretPlan::X509(p) => p.path.clone(),
            SecretPlan::Rsa(p) | SecretPlan::Ssh(p) => p.path.clone(),
            SecretPlan::Dhparams(p) => p.path.clone(),
            SecretPlan::Random(p) => format!("{}:{}", p.path, p.key),
            SecretPlan::Error(p) => p.path.clone(),
        }
    }

    /// Path without any `:key` component.
    pub fn base_store_path(&self) -> &str {
        match self {
            SecretPlan::X509(p) => &p.path,
            SecretPlan::Rsa(p) | SecretPlan::Ssh(p) => &p.path,
            SecretPlan::Dhparams(p) => &p.path,
            SecretPlan::Random(p) => &p.path,
            SecretPlan::Error(p) => &p.path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SecretPlan::X509(_) => "x509",
            SecretPlan::Rsa(_) => "rsa",
            SecretPlan::Ssh(_) => "ssh",
            SecretPlan::Dhparams(_) => "dhparams",
            SecretPlan::Random(_) => "random",
            SecretPlan::Error(_) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SecretPlan::Error(_))
    }

    pub fn fixed(&self) -> bool {
        match self {
            SecretPlan::Rsa(p) | SecretPlan::Ssh(p) => p.fixed,
            SecretPlan::Dhparams(p) => p.fixed,
            SecretPlan::Random(p) => p.fixed,
            _ => false,
        }
    }

    /// Keys a correctly materialized secret stores under its path.
    pub fn expected_keys(&self) -> Vec<String> {
        match self {
            SecretPlan::X509(p) => {
                let mut keys = vec![
                    "certificate".to_string(),
                    "combined".to_string(),
                    "key".to_string(),
                ];
                if p.is_ca {
                    keys.push("crl".to_string());
                    keys.push("serial".to_string());
                }
                keys
            }
            SecretPlan::Rsa(_) => vec!["private".to_string(), "public".to_string()],
            SecretPlan::Ssh(_) => vec![
                "private".to_string(),
                "public".to_string(),
                "fingerprint".to_string(),
            ],
            SecretPlan::Dhparams(_) => vec!["dhparam-pem".to_string()],
            SecretPlan::Random(p) => {
                let mut keys = vec![p.key.clone()];
                if let Some(formatted) = p.formatted_key() {
                    keys.push(formatted);
                }
                keys
            }
            SecretPlan::Error(_) => Vec::new(),
        }
    }

    /// Downgrade in place, preserving the path.
    pub fn into_error(self, error: impl Into<String>) -> SecretPlan {
        SecretPlan::Error(ErrorPlan {
            path: self.path(),
            error: error.into(),
        })
    }
}
