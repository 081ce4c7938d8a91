#![forbid(unsafe_code)]

pub mod bosh;
pub mod config;
pub mod configs;
pub mod context;
pub mod env;
pub mod error;
pub mod hooks;
pub mod kit;
pub mod prompt;
pub mod reactor;
pub mod run;
pub mod secrets;
pub mod store;
pub mod telemetry;

pub use config::{CliArgs, Command, GenesisConfig};
pub use context::Context;
pub use env::{EnvName, Environment};
pub use error::GenesisError;
pub use kit::KitRuntime;
pub use reactor::{DeployOptions, Reactor};
pub use secrets::{
    CheckSummary, ItemReport, Outcome, PlanAction, PlanExecutor, PlanValidator, ProgressEvent,
    ProgressSink, SecretPlan,
};
pub use store::{StoreClient, StoreStatus, StoreTarget, TargetRegistry};
