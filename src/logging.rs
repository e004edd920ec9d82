use anyhow::{Context, Result};
use std::{fs, path::Path};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE: &str = "modsmith.log";

/// Routes `tracing` output to `<data_dir>/modsmith.log`. `RUST_LOG`
/// overrides the default `info` filter.
pub fn init(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir).context("create log dir")?;
    let appender = tracing_appender::rolling::never(data_dir, LOG_FILE);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}
