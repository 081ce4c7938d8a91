use clap::Parser;

use genesis::config::{CliArgs, GenesisConfig};
use genesis::{run, telemetry};

fn main() {
    telemetry::init();
    let cli = CliArgs::parse();
    match GenesisConfig::from_env_and_args(cli) {
        Ok(config) => {
            if let Err(err) = run::run(config) {
                eprintln!("error: {err}");
                std::process::exit(err.exit_code());
            }
        }
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
