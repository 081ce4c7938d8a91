use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{GenesisError, Result};

pub mod client;
pub mod registry;

pub use client::{StoreClient, StoreStatus};
pub use registry::{StoreTarget, TargetFilter, TargetRegistry};

/// Captured result of one store CLI invocation. Both streams are fully
/// drained before the exit status is interpreted.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout and stderr joined, trimmed. Used for output-pattern matching.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Runner responsible for executing the secrets store CLI.
///
/// `target` selects the store session; `interactive` hands the controlling
/// terminal to the subprocess (used by valueless `set`).
pub trait SafeRunner: Send + Sync {
    fn run(&self, target: Option<&str>, args: &[String], interactive: bool) -> Result<CliOutput>;
}

pub struct DefaultSafeRunner {
    binary: PathBuf,
}

impl DefaultSafeRunner {
    pub fn discover() -> Result<Self> {
        let binary = which::which("safe").map_err(|_| GenesisError::DependencyMissing {
            binary: "safe".into(),
            hint: "install safe (https://github.com/starkandwayne/safe) and target your vault".into(),
        })?;
        Ok(Self { binary })
    }
}

impl SafeRunner for DefaultSafeRunner {
    fn run(&self, target: Option<&str>, args: &[String], interactive: bool) -> Result<CliOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        // The target override must always win, and debug chatter from the
        // user's shell profile would corrupt parseable output.
        command.env_remove("SAFE_TRACE").env_remove("DEBUG");
        if let Some(target) = target {
            command.env("SAFE_TARGET", target);
        }
        if interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = command.status()?;
            return Ok(CliOutput {
                status: status.code(),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        command.stdin(Stdio::null());
        debug!(args = ?args, "safe");
        let output = command.output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                GenesisError::DependencyMissing {
                    binary: "safe".into(),
                    hint: "install safe and re-run".into(),
                }
            } else {
                GenesisError::Io(err)
            }
        })?;
        Ok(CliOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
