use crate::config::LoggingConfig;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
const SYSLOG_IDENTITY: &std::ffi::CStr = c"access-log-exporter";

/// Install the global subscriber: stderr by default, the local syslog daemon when configured.
///
/// `RUST_LOG` overrides the default `info` filter in both modes.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false);

    let installed = if config.syslog {
        // syslog stamps its own time and has no use for colour codes.
        builder
            .with_ansi(false)
            .without_time()
            .with_writer(syslog_writer()?)
            .try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[cfg(unix)]
fn syslog_writer() -> Result<syslog_tracing::Syslog> {
    let (options, facility) = Default::default();
    syslog_tracing::Syslog::new(SYSLOG_IDENTITY, options, facility)
        .ok_or_else(|| anyhow!("syslog is already in use by this process"))
}

#[cfg(not(unix))]
fn syslog_writer() -> Result<fn() -> std::io::Stderr> {
    anyhow::bail!("logging.syslog is only supported on unix platforms")
}
