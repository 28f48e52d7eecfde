use std::process::ExitCode;

use anyhow::{anyhow, Result};
use labgate_core::config::{GovernanceConfig, LoadOptions, LogFormat};
use tracing::Level;

/// Logs go to stderr so stdout stays a single machine-readable result.
fn init_logging(config: &GovernanceConfig) -> Result<()> {
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!("failed to install tracing subscriber: {error}"))
}

fn main() -> ExitCode {
    // Commands report config errors themselves; logging just falls back to silence.
    if let Ok(config) = GovernanceConfig::load(LoadOptions::default()) {
        if let Err(error) = init_logging(&config) {
            eprintln!("{error:#}");
        }
    }
    labgate_cli::run()
}
