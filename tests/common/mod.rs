#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use genesis::env::{EvalMode, MergeFailure, Merger};
use genesis::error::Result;
use genesis::store::{CliOutput, SafeRunner, StoreClient, StoreTarget, TargetRegistry};

type Tree = BTreeMap<String, BTreeMap<String, String>>;

/// In-memory stand-in for the secrets store CLI, honoring the subset of the
/// wire operations the engine emits.
pub struct MemorySafe {
    pub data: Mutex<Tree>,
    pub invocations: Mutex<Vec<Vec<String>>>,
}

impl MemorySafe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(BTreeMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn seed(&self, path: &str, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, path: &str, key: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap()
            .get(path)
            .and_then(|entry| entry.get(key))
            .cloned()
    }

    fn ok(stdout: String) -> Result<CliOutput> {
        Ok(CliOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn fail(stderr: String) -> Result<CliOutput> {
        Ok(CliOutput {
            status: Some(1),
            stdout: String::new(),
            stderr,
        })
    }

    fn exists(&self, spec: &str) -> bool {
        let data = self.data.lock().unwrap();
        match spec.split_once(':') {
            Some((path, key)) => data.get(path).is_some_and(|e| e.contains_key(key)),
            None => data.get(spec).is_some_and(|e| !e.is_empty()),
        }
    }

    fn insert_many(&self, path: &str, pairs: &[(String, String)]) {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(path.to_string()).or_default();
        for (key, value) in pairs {
            entry.insert(key.clone(), value.clone());
        }
    }

    fn no_clobber_hit(&self, args: &[String], path: &str) -> Option<Result<CliOutput>> {
        if args.iter().any(|a| a == "--no-clobber") && self.exists(path) {
            return Some(Self::ok(format!(
                "refusing to update {path}: secret is already present"
            )));
        }
        None
    }
}

impl SafeRunner for MemorySafe {
    fn run(&self, _target: Option<&str>, args: &[String], _interactive: bool) -> Result<CliOutput> {
        self.invocations.lock().unwrap().push(args.to_vec());
        let command = args.first().map(String::as_str).unwrap_or("");
        match command {
            "env" => Self::ok(r#"{"VAULT_TOKEN":"test-token"}"#.to_string()),
            "status" => Self::ok(String::new()),
            "exists" => {
                if self.exists(&args[1]) {
                    Self::ok(String::new())
                } else {
                    Self::fail(format!("{} does not exist", args[1]))
                }
            }
            "export" => {
                let data = self.data.lock().unwrap();
                let mut subset: Tree = BTreeMap::new();
                for prefix in &args[1..] {
                    for (path, entry) in data.iter() {
                        if path == prefix || path.starts_with(&format!("{prefix}/")) {
                            subset.insert(path.clone(), entry.clone());
                        }
                    }
                }
                Self::ok(serde_json::to_string(&subset).unwrap())
            }
            "paths" => {
                let data = self.data.lock().unwrap();
                let mut lines = Vec::new();
                for prefix in &args[1..] {
                    for path in data.keys() {
                        if path == prefix || path.starts_with(&format!("{prefix}/")) {
                            lines.push(path.clone());
                        }
                    }
                }
                Self::ok(lines.join("\n"))
            }
            "set" => {
                let path = &args[1];
                let pairs: Vec<(String, String)> = args[2..]
                    .iter()
                    .filter_map(|kv| {
                        kv.split_once('=')
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                    })
                    .collect();
                self.insert_many(path, &pairs);
                Self::ok(String::new())
            }
            "rm" => {
                let spec = args.last().unwrap();
                let mut data = self.data.lock().unwrap();
                match spec.split_once(':') {
                    Some((path, key)) => {
                        if let Some(entry) = data.get_mut(path) {
                            entry.remove(key);
                        }
                    }
                    None => {
                        data.remove(spec.as_str());
                    }
                }
                Self::ok(String::new())
            }
            "gen" => {
                let positional: Vec<&String> = args[1..]
                    .iter()
                    .take_while(|a| *a != "--")
                    .filter(|a| !a.starts_with("--"))
                    .collect();
                let size: usize = positional[0].parse().unwrap();
                let path = positional[positional.len() - 2].clone();
                let key = positional[positional.len() - 1].clone();
                if let Some(refused) = self.no_clobber_hit(args, &path) {
                    let already = self.exists(&format!("{path}:{key}"));
                    if already {
                        return refused;
                    }
                }
                self.insert_many(&path, &[(key.clone(), "r".repeat(size))]);
                if let Some(fmt_at) = args.iter().position(|a| a == "fmt") {
                    let dest = args[fmt_at + 4].clone();
                    self.insert_many(&path, &[(dest, "formatted".to_string())]);
                }
                Self::ok(String::new())
            }
            "rsa" | "ssh" => {
                let path = args[2].clone();
                if let Some(refused) = self.no_clobber_hit(args, &path) {
                    return refused;
                }
                let mut pairs = vec![
                    ("private".to_string(), "PRIVATE KEY".to_string()),
                    ("public".to_string(), "PUBLIC KEY".to_string()),
                ];
                if command == "ssh" {
                    pairs.push(("fingerprint".to_string(), "SHA256:abcdef".to_string()));
                }
                self.insert_many(&path, &pairs);
                Self::ok(String::new())
            }
            "dhparam" => {
                let path = args[2].clone();
                if let Some(refused) = self.no_clobber_hit(args, &path) {
                    return refused;
                }
                self.insert_many(
                    &path,
                    &[(
                        "dhparam-pem".to_string(),
                        "-----BEGIN DH PARAMETERS-----".to_string(),
                    )],
                );
                Self::ok(String::new())
            }
            "x509" => match args[1].as_str() {
                "issue" => {
                    let path = args[2].clone();
                    if let Some(refused) = self.no_clobber_hit(args, &path) {
                        return refused;
                    }
                    let mut pairs = vec![
                        ("certificate".to_string(), "CERTIFICATE".to_string()),
                        ("combined".to_string(), "COMBINED".to_string()),
                        ("key".to_string(), "KEY".to_string()),
                    ];
                    if args.iter().any(|a| a == "--ca") {
                        pairs.push(("crl".to_string(), "CRL".to_string()));
                        pairs.push(("serial".to_string(), "01".to_string()));
                    }
                    self.insert_many(&path, &pairs);
                    Self::ok(String::new())
                }
                "renew" => Self::ok(format!(
                    "Renewed x509 cert at {}: expiry set to 2030-01-01",
                    args[2]
                )),
                "validate" => Self::ok(String::new()),
                other => Self::fail(format!("unknown x509 subcommand {other}")),
            },
            "targets" => Self::ok("[]".to_string()),
            other => Self::fail(format!("unhandled safe command {other}")),
        }
    }
}

/// Deep-merging stand-in for the external merge tool. Refuses non-deferred
/// `(( vault … ))` operators in full evaluation mode, mirroring how the
/// real tool fails when the store cannot resolve a reference.
pub struct DeepMerger;

fn deep_merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}

impl Merger for DeepMerger {
    fn merge(&self, files: &[PathBuf], mode: EvalMode) -> std::result::Result<String, MergeFailure> {
        let mut merged = serde_json::Value::Object(serde_json::Map::new());
        for file in files {
            let text = std::fs::read_to_string(file).map_err(|err| MergeFailure {
                detail: err.to_string(),
            })?;
            if mode == EvalMode::Full {
                if let Some(start) = text.find("(( vault") {
                    let end = text[start..].find("))").map(|e| start + e + 2).unwrap();
                    return Err(MergeFailure {
                        detail: format!(
                            "$.secret: could not resolve {} against the store",
                            &text[start..end]
                        ),
                    });
                }
            }
            let doc: serde_json::Value =
                serde_yaml_bw::from_str(&text).map_err(|err| MergeFailure {
                    detail: format!("{}: {err}", file.display()),
                })?;
            deep_merge(&mut merged, doc);
        }
        serde_yaml_bw::to_string(&merged).map_err(|err| MergeFailure {
            detail: err.to_string(),
        })
    }
}

/// A store client over [`MemorySafe`] whose URL points at a live local
/// listener so the reachability probe succeeds.
pub struct TestStore {
    pub safe: Arc<MemorySafe>,
    pub client_target: StoreTarget,
    _listener: std::net::TcpListener,
}

impl TestStore {
    pub fn new() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let port = listener.local_addr().unwrap().port();
        let safe = MemorySafe::new();
        let client_target = StoreTarget {
            name: "test".into(),
            url: format!("http://127.0.0.1:{port}"),
            verify: true,
        };
        Self {
            safe,
            client_target,
            _listener: listener,
        }
    }

    pub fn client(&self) -> StoreClient {
        StoreClient::new(self.client_target.clone(), self.safe.clone())
    }

    pub fn registry(&self) -> TargetRegistry {
        TargetRegistry::from_targets(vec![self.client_target.clone()])
    }
}
