use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_json::Value;
use tracing::debug;

use crate::env::Environment;
use crate::error::{GenesisError, Result};
use crate::kit::KitRuntime;
use crate::store::StoreClient;

/// Environment-variable contract handed to every spawned hook or reaction.
/// `clear` names inherited variables that must not leak through.
#[derive(Debug, Default, Clone)]
pub struct HookEnv {
    pub set: BTreeMap<String, String>,
    pub clear: Vec<String>,
}

impl HookEnv {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.set.insert(key.to_string(), value.into());
    }

    pub fn clear_var(&mut self, key: &str) {
        self.clear.push(key.to_string());
    }
}

/// The three forms of "run something external" share one shape: resolve the
/// command, apply the documented environment, invoke, interpret.
#[derive(Debug)]
pub enum ExternalTask<'a> {
    KitHook {
        kit: &'a KitRuntime,
        hook: &'a str,
        args: Vec<String>,
    },
    ReactionScript {
        script: &'a str,
        args: &'a [String],
    },
    ReactionAddon {
        kit: &'a KitRuntime,
        addon: &'a str,
        args: &'a [String],
    },
}

impl ExternalTask<'_> {
    fn resolve(&self, root: &Path) -> Result<(PathBuf, Vec<String>)> {
        match self {
            ExternalTask::KitHook { kit, hook, args } => {
                let path = kit.hook_path(hook);
                if !path.exists() {
                    return Err(GenesisError::Kit(format!(
                        "kit {} has no {hook} hook",
                        kit.id()
                    )));
                }
                Ok((path, args.clone()))
            }
            ExternalTask::ReactionScript { script, args } => {
                let path = if Path::new(script).is_absolute() {
                    PathBuf::from(script)
                } else {
                    root.join(script)
                };
                if !path.exists() {
                    return Err(GenesisError::Config(format!(
                        "reaction script {script} does not exist"
                    )));
                }
                Ok((path, args.to_vec()))
            }
            ExternalTask::ReactionAddon { kit, addon, args } => {
                let path = kit.hook_path("addon");
                if !path.exists() {
                    return Err(GenesisError::Config(format!(
                        "reaction addon '{addon}' requires kit {} to supply an addon hook",
                        kit.id()
                    )));
                }
                let mut full_args = vec![addon.to_string()];
                full_args.extend(args.iter().cloned());
                Ok((path, full_args))
            }
        }
    }

    fn label(&self) -> String {
        match self {
            ExternalTask::KitHook { hook, .. } => format!("kit hook {hook}"),
            ExternalTask::ReactionScript { script, .. } => format!("script {script}"),
            ExternalTask::ReactionAddon { addon, .. } => format!("addon {addon}"),
        }
    }
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub status: i32,
    pub stdout: String,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Invoke a task from `root` with the documented environment. With
/// `capture`, stdout is collected for the caller (pre-deploy data payloads,
/// reaction `var` captures); stderr always reaches the user.
pub fn run_task(
    task: &ExternalTask<'_>,
    root: &Path,
    env: &HookEnv,
    capture: bool,
) -> Result<TaskOutcome> {
    let (program, args) = task.resolve(root)?;
    debug!(task = %task.label(), program = %program.display(), "spawning");
    let mut command = Command::new(&program);
    command.args(&args).current_dir(root).stdin(Stdio::inherit());
    for key in &env.clear {
        command.env_remove(key);
    }
    command.envs(&env.set);
    if capture {
        command.stdout(Stdio::piped()).stderr(Stdio::inherit());
        let output = command.output().map_err(|err| spawn_error(&program, err))?;
        Ok(TaskOutcome {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    } else {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        let status = command.status().map_err(|err| spawn_error(&program, err))?;
        Ok(TaskOutcome {
            status: status.code().unwrap_or(-1),
            stdout: String::new(),
        })
    }
}

fn spawn_error(program: &Path, err: std::io::Error) -> GenesisError {
    GenesisError::Subprocess {
        command: program.display().to_string(),
        status: None,
        output: err.to_string(),
    }
}

/// Variable name mangling for `GENESIS_<TYPE>_CONFIG`-style exports.
pub fn env_var_key(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// The base contract every hook and reaction sees. Deploy stages extend it
/// with their stage-specific variables.
pub fn base_hook_env(
    environment: &Environment,
    kit: &KitRuntime,
    store: &StoreClient,
    params: Option<&Value>,
) -> HookEnv {
    let mut env = HookEnv::default();
    env.insert("GENESIS_ROOT", environment.root.display().to_string());
    env.insert("GENESIS_ENVIRONMENT", environment.name.as_str());
    env.insert("GENESIS_TYPE", &environment.kit_name);
    env.insert("GENESIS_CALL_BIN", "genesis");
    env.insert("GENESIS_CALL_ENV", format!("genesis {}", environment.name));
    env.insert("GENESIS_CALL_PREFIX", format!("genesis {}", environment.name));
    env.insert(
        "GENESIS_CALL_FULL",
        format!("genesis {} --type {}", environment.name, environment.kit_name),
    );
    env.insert("GENESIS_MIN_VERSION", {
        environment
            .min_version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default()
    });
    if let Some(params) = params {
        env.insert(
            "GENESIS_ENVIRONMENT_PARAMS",
            serde_json::to_string(params).unwrap_or_else(|_| "{}".into()),
        );
    }

    env.insert("GENESIS_TARGET_VAULT", &store.target().url);
    env.insert(
        "GENESIS_VERIFY_VAULT",
        if store.target().verify { "1" } else { "0" },
    );

    env.insert("GENESIS_KIT_NAME", &kit.name);
    env.insert("GENESIS_KIT_VERSION", &kit.version);

    let secrets_base = environment.secrets_base();
    env.insert("GENESIS_SECRETS_MOUNT", &environment.secrets_mount);
    env.insert("GENESIS_SECRETS_BASE", format!("{secrets_base}/"));
    env.insert("GENESIS_SECRETS_SLUG", &environment.secrets_path);
    env.insert("GENESIS_EXODUS_MOUNT", &environment.exodus_mount);
    env.insert("GENESIS_EXODUS_BASE", environment.exodus_path());
    env.insert("GENESIS_CI_MOUNT", &environment.ci_mount);
    mount_override(&mut env, "GENESIS_SECRETS_MOUNT_OVERRIDE", &environment.secrets_mount, "secret");
    mount_override(
        &mut env,
        "GENESIS_EXODUS_MOUNT_OVERRIDE",
        &environment.exodus_mount,
        &format!("{}/exodus", environment.secrets_mount),
    );
    mount_override(
        &mut env,
        "GENESIS_CI_MOUNT_OVERRIDE",
        &environment.ci_mount,
        &format!("{}/ci", environment.secrets_mount),
    );
    env.insert(
        "GENESIS_ROOT_CA_PATH",
        environment.root_ca_path.clone().unwrap_or_default(),
    );
    env.insert(
        "GENESIS_REQUESTED_FEATURES",
        environment.features.join(" "),
    );

    if environment.use_create_env {
        for var in [
            "BOSH_ALIAS",
            "BOSH_ENVIRONMENT",
            "BOSH_CA_CERT",
            "BOSH_CLIENT",
            "BOSH_CLIENT_SECRET",
            "BOSH_DEPLOYMENT",
        ] {
            env.clear_var(var);
        }
    } else {
        env.insert("BOSH_ALIAS", &environment.bosh_env.alias);
        env.insert("BOSH_DEPLOYMENT", environment.deployment_name());
    }
    env
}

fn mount_override(env: &mut HookEnv, key: &str, actual: &str, default: &str) {
    let value = if actual == default { "" } else { actual };
    env.insert(key, value);
}
