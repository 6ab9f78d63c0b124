use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use crate::config::LogFormat;
use crate::error::{Error, Result};

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str, format: &LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    let res = match format {
        LogFormat::Json => tracing_subscriber::registry().with(env).with(base.json()).try_init(),
        LogFormat::Text => tracing_subscriber::registry().with(env).with(base.compact()).try_init(),
    };
    res.map_err(|e| Error::Options(format!("logging already initialised: {e}")))
}
