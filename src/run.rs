use std::sync::Arc;
use std::time::Instant;

use semver::Version;
use tracing::info;

use crate::bosh::DefaultBoshRunner;
use crate::config::{Command, GenesisConfig, OutputFormat, SecretsAction};
use crate::context::Context;
use crate::env::{Environment, SpruceMerger};
use crate::error::{GenesisError, Result};
use crate::kit::KitRuntime;
use crate::prompt::{DenyingPrompter, Prompter, TerminalPrompter};
use crate::reactor::{DeployOptions, Reactor};
use crate::secrets::validator::OpensslInspector;
use crate::secrets::{
    CheckSummary, ParseOptions, PlanAction, PlanExecutor, PlanValidator, ProgressEvent,
    ProgressSink, plans_for,
};
use crate::store::DefaultSafeRunner;

const MINIMUM_BOSH_VERSION: Version = Version::new(2, 0, 0);

/// Renders progress events as single-line status output with box-drawn
/// glyphs; all counters and timing live here, not in the engine.
pub struct ConsoleSink {
    started: Instant,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleSink {
    fn on_event(&mut self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::Wait { message } => eprintln!("{message}..."),
            ProgressEvent::WaitDone => {}
            ProgressEvent::Init { action, total } => {
                eprintln!("Performing {action} on {total} secrets...");
                self.started = Instant::now();
            }
            ProgressEvent::StartItem { .. } => {}
            ProgressEvent::DoneItem { report, .. } => {
                let mut lines = report.detail.lines();
                let first = lines.next().unwrap_or("");
                if first.is_empty() {
                    println!("  {} {}", report.outcome.glyph(), report.path);
                } else {
                    println!("  {} {}: {}", report.outcome.glyph(), report.path, first);
                }
                for line in lines {
                    println!("      {line}");
                }
            }
            ProgressEvent::Prompt { message } => eprintln!("{message}"),
            ProgressEvent::Empty => eprintln!("Nothing to do."),
            ProgressEvent::Abort { message } => eprintln!("aborted: {message}"),
            ProgressEvent::Completed { summary } => {
                eprintln!(
                    "Completed in {:.1}s: {} ok, {} skipped, {} missing, {} warnings, {} errors",
                    self.started.elapsed().as_secs_f32(),
                    summary.ok,
                    summary.skipped,
                    summary.missing,
                    summary.warn,
                    summary.error,
                );
            }
        }
    }
}

fn summary_status(summary: &CheckSummary, strict: bool) -> Result<()> {
    if summary.failed(strict) {
        return Err(GenesisError::Other(format!(
            "{} of {} secrets failed checks",
            summary.missing + summary.error + if strict { summary.warn } else { 0 },
            summary.total()
        )));
    }
    Ok(())
}

struct Session {
    ctx: Context,
    environment: Environment,
    kit: KitRuntime,
}

fn open_session(config: &GenesisConfig, env_name: &str) -> Result<Session> {
    let safe_runner = Arc::new(DefaultSafeRunner::discover()?);
    let prompter: Box<dyn Prompter> = if config.no_prompt {
        Box::new(DenyingPrompter)
    } else {
        Box::new(TerminalPrompter)
    };
    let ctx = Context::new(&config.root, safe_runner, config.vault.as_deref(), prompter)?;
    let environment = Environment::load(&config.root, env_name)?;
    let mut kit = KitRuntime::discover(
        &config.root,
        &environment.kit_name,
        environment.kit_version.as_deref(),
    )?;
    if let Some(overrides) = &environment.kit_overrides {
        kit.apply_overrides(overrides);
    }
    info!(
        "environment {} using kit {}",
        environment.name,
        kit.id()
    );
    Ok(Session {
        ctx,
        environment,
        kit,
    })
}

pub fn run(config: GenesisConfig) -> Result<()> {
    match &config.command {
        Command::Check { env, strict } => {
            let session = open_session(&config, &env.environment)?;
            let merger = SpruceMerger::discover()?;
            let bosh = Arc::new(DefaultBoshRunner::discover(&MINIMUM_BOSH_VERSION)?);
            let reactor = Reactor::new(
                &session.ctx,
                &session.environment,
                &session.kit,
                &merger,
                bosh,
            );
            let mut sink = ConsoleSink::new();
            let summary = reactor.check(&mut sink)?;
            summary_status(&summary, *strict)
        }
        Command::Manifest {
            env,
            redacted,
            output,
        } => {
            let session = open_session(&config, &env.environment)?;
            let merger = SpruceMerger::discover()?;
            let bosh = Arc::new(DefaultBoshRunner::discover(&MINIMUM_BOSH_VERSION)?);
            let reactor = Reactor::new(
                &session.ctx,
                &session.environment,
                &session.kit,
                &merger,
                bosh,
            );
            let manifest = reactor.manifest(*redacted)?;
            match output {
                OutputFormat::Yaml => print!("{manifest}"),
                OutputFormat::Json => {
                    let doc: serde_json::Value = serde_yaml_bw::from_str(&manifest)?;
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
            Ok(())
        }
        Command::Deploy(args) => {
            let session = open_session(&config, &args.env.environment)?;
            let merger = SpruceMerger::discover()?;
            let bosh = Arc::new(DefaultBoshRunner::discover(&MINIMUM_BOSH_VERSION)?);
            let reactor = Reactor::new(
                &session.ctx,
                &session.environment,
                &session.kit,
                &merger,
                bosh,
            );
            let options = DeployOptions {
                flags: args.bosh_flags.clone(),
                dry_run: args.dry_run,
                yes: args.yes,
                strict: args.strict,
            };
            let mut sink = ConsoleSink::new();
            reactor.deploy(&options, &mut sink)
        }
        Command::Secrets(args) => {
            let session = open_session(&config, &args.env.environment)?;
            run_secrets(&config, &session, args)
        }
    }
}

fn run_secrets(
    _config: &GenesisConfig,
    session: &Session,
    args: &crate::config::SecretsArgs,
) -> Result<()> {
    let environment = &session.environment;
    session.ctx.store.require_ok(&environment.secrets_mount)?;

    let hook_env = crate::hooks::base_hook_env(
        environment,
        &session.kit,
        &session.ctx.store,
        None,
    );
    let features =
        session
            .kit
            .final_features(&session.ctx.root, &environment.features, &hook_env)?;

    let mut options = ParseOptions::new();
    options.root_ca_path = environment.root_ca_path.clone();
    options.filter = args.filter.clone();
    options.validate = args.action != SecretsAction::Remove;
    let plans = plans_for(&session.kit.metadata, &features, &options)?;

    let base = environment.secrets_base();
    let mut sink = ConsoleSink::new();
    match args.action {
        SecretsAction::Add => {
            let executor = PlanExecutor::new(&session.ctx.store, &base);
            let summary = executor.execute(PlanAction::Add, &plans, &mut sink)?;
            summary_status(&summary, args.strict)
        }
        SecretsAction::Rotate => {
            let executor = PlanExecutor::new(&session.ctx.store, &base);
            let summary = executor.execute(PlanAction::Recreate, &plans, &mut sink)?;
            summary_status(&summary, args.strict)
        }
        SecretsAction::Renew => {
            let executor = PlanExecutor::new(&session.ctx.store, &base);
            let summary = executor.execute(PlanAction::Renew, &plans, &mut sink)?;
            summary_status(&summary, args.strict)
        }
        SecretsAction::Remove => {
            if !args.yes {
                let confirmed = session.ctx.prompter.confirm(&format!(
                    "Remove {} secrets under {base}?",
                    plans.len()
                ))?;
                if !confirmed {
                    eprintln!("Nothing removed.");
                    return Ok(());
                }
            }
            let executor = PlanExecutor::new(&session.ctx.store, &base);
            let summary = executor.execute(PlanAction::Remove, &plans, &mut sink)?;
            summary_status(&summary, args.strict)
        }
        SecretsAction::Check => {
            let inspector = OpensslInspector;
            let validator = PlanValidator::new(&session.ctx.store, &base, &inspector);
            let summary = validator.check(&plans, &mut sink)?;
            summary_status(&summary, args.strict)
        }
        SecretsAction::Validate => {
            let inspector = OpensslInspector;
            let validator = PlanValidator::new(&session.ctx.store, &base, &inspector);
            let summary = validator.validate(&plans, &mut sink)?;
            summary_status(&summary, args.strict)
        }
    }
}
