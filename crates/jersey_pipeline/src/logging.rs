use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// `info` by default, `debug` with `--verbose`; `RUST_LOG` wins when set.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logger: {e}"))
}
