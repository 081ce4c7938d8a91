use std::env;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::{GenesisError, Result};

/// Output format for rendering commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// Secret lifecycle actions exposed on the CLI.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsAction {
    /// Generate any secrets that do not exist yet.
    Add,
    /// Regenerate secrets, preserving ones marked fixed.
    Rotate,
    /// Renew certificates (other secret types are skipped).
    Renew,
    /// Remove this environment's secrets from the store.
    Remove,
    /// Verify that every expected secret exists.
    Check,
    /// Deep validation: structure, cryptography, policy.
    Validate,
}

impl SecretsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretsAction::Add => "add",
            SecretsAction::Rotate => "rotate",
            SecretsAction::Renew => "renew",
            SecretsAction::Remove => "remove",
            SecretsAction::Check => "check",
            SecretsAction::Validate => "validate",
        }
    }
}

#[derive(Debug, Args)]
pub struct EnvArgs {
    /// Environment name (its <name>.yml must exist in the repo root).
    pub environment: String,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    /// Skip confirmations (drift, removals).
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Validate and render everything but skip state changes.
    #[arg(long)]
    pub dry_run: bool,

    /// Treat warnings as failures.
    #[arg(long)]
    pub strict: bool,

    /// Flags passed through to the BOSH invocation, after `--`.
    #[arg(last = true)]
    pub bosh_flags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SecretsArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    #[command(subcommand)]
    pub action: SecretsAction,

    /// Only touch plans whose path matches `/<regex>/[i]` (prefix with !
    /// to negate).
    #[arg(long)]
    pub filter: Option<String>,

    /// Treat warnings as failures.
    #[arg(long)]
    pub strict: bool,

    /// Skip confirmations.
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pre-flight an environment: store, kit, secrets, configs, stemcells.
    Check {
        #[command(flatten)]
        env: EnvArgs,
        /// Treat warnings as failures.
        #[arg(long)]
        strict: bool,
    },
    /// Render the deployment manifest without deploying.
    Manifest {
        #[command(flatten)]
        env: EnvArgs,
        /// Leave secret references unevaluated.
        #[arg(long)]
        redacted: bool,
        #[arg(long, value_enum, default_value = "yaml")]
        output: OutputFormat,
    },
    /// Run the full deploy pipeline for an environment.
    Deploy(DeployArgs),
    /// Manage an environment's secrets in the credentials store.
    Secrets(SecretsArgs),
}

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "genesis",
    version,
    about = "Deployment-environment orchestrator for BOSH-style infrastructure.",
    long_about = "Composes hierarchical environment YAML, manages the environment's secrets \
                  in a safe/Vault credentials store, and drives deploys through the BOSH CLI \
                  or a local create-env bootstrap."
)]
pub struct CliArgs {
    /// Repository root holding the environment files (defaults to $GENESIS_ROOT or `.`).
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Credentials store target alias or URL (defaults to $GENESIS_VAULT).
    #[arg(long, global = true)]
    pub vault: Option<String>,

    /// Fail instead of asking questions on the terminal.
    #[arg(long, global = true)]
    pub no_prompt: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Resolved configuration: flags layered over environment variables.
#[derive(Debug)]
pub struct GenesisConfig {
    pub root: PathBuf,
    pub vault: Option<String>,
    pub no_prompt: bool,
    pub command: Command,
}

impl GenesisConfig {
    pub fn from_env_and_args(cli: CliArgs) -> Result<Self> {
        let root = cli
            .cwd
            .or_else(|| env::var("GENESIS_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        if !root.is_dir() {
            return Err(GenesisError::Config(format!(
                "repository root {} is not a directory",
                root.display()
            )));
        }
        let vault = cli.vault.or_else(|| env::var("GENESIS_VAULT").ok());
        Ok(Self {
            root,
            vault,
            no_prompt: cli.no_prompt,
            command: cli.command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deploy_with_passthrough_flags() {
        let cli = CliArgs::parse_from([
            "genesis",
            "deploy",
            "us-east-prod",
            "--dry-run",
            "--",
            "--fix",
            "--recreate",
        ]);
        let Command::Deploy(args) = &cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.env.environment, "us-east-prod");
        assert!(args.dry_run);
        assert_eq!(args.bosh_flags, vec!["--fix", "--recreate"]);
    }

    #[test]
    fn parses_secrets_actions() {
        let cli = CliArgs::parse_from([
            "genesis",
            "secrets",
            "us-east-prod",
            "--filter",
            "/tls/",
            "rotate",
        ]);
        let Command::Secrets(args) = &cli.command else {
            panic!("expected secrets");
        };
        assert_eq!(args.action, SecretsAction::Rotate);
        assert_eq!(args.filter.as_deref(), Some("/tls/"));
    }

    #[test]
    fn config_rejects_missing_root() {
        let cli = CliArgs::parse_from([
            "genesis",
            "--cwd",
            "/definitely/not/a/dir",
            "check",
            "sandbox",
        ]);
        let err = GenesisConfig::from_env_and_args(cli).unwrap_err();
        assert!(matches!(err, GenesisError::Config(_)));
    }
}
