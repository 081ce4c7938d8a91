use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `GENESIS_LOG` controls the filter
/// (e.g. `GENESIS_LOG=genesis=debug`); default is warnings plus our info.
pub fn init() {
    let filter = EnvFilter::try_from_env("GENESIS_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn,genesis=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
