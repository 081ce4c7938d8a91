use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("environment file error in {file}: {detail}")]
    EnvFile { file: PathBuf, detail: String },

    #[error("kit error: {0}")]
    Kit(String),

    #[error("missing dependency: {binary} not found on PATH. {hint}")]
    DependencyMissing { binary: String, hint: String },

    #[error("incompatible dependency: {binary} is {found}, need at least {minimum}")]
    DependencyVersion {
        binary: String,
        found: String,
        minimum: String,
    },

    #[error("secrets store {target} is {state}: {remedy}")]
    Store {
        target: String,
        state: String,
        remedy: String,
    },

    #[error("secret plan error at {path}: {detail}")]
    Plan { path: String, detail: String },

    #[error("'{command}' exited {status:?}: {output}")]
    Subprocess {
        command: String,
        status: Option<i32>,
        output: String,
    },

    #[error("cyclical CA signage detected involving {0}")]
    Cycle(String),

    #[error("merge failed after {attempts} adaptive passes: {detail}")]
    Merge { attempts: usize, detail: String },

    #[error("deployment of {env} failed: {detail}")]
    Deploy { env: String, detail: String },

    #[error("prompt refused: {0}")]
    Prompt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected error: {0}")]
    Other(String),
}

impl GenesisError {
    /// Process exit code for the error class. Configuration and dependency
    /// problems exit 2 so pipelines can tell them from deploy failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            GenesisError::Config(_)
            | GenesisError::EnvFile { .. }
            | GenesisError::Kit(_)
            | GenesisError::DependencyMissing { .. }
            | GenesisError::DependencyVersion { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, GenesisError>;
