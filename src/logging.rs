use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Initializes a tracing subscriber that logs to stderr.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info", "debug") when set, so
/// stdout stays reserved for the resolved endpoint.
pub fn init(default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install the log subscriber: {}", err))
}
