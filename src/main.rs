use anyhow::{Context, Result};
use multiflash::{config, core::Orchestrator, logging};
use std::path::PathBuf;

/// Environment variable pointing at the configuration file.
const CONFIG_ENV: &str = "MULTIFLASH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "multiflash.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = config::load_config(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    logging::init((&config.log).into());

    let report = Orchestrator::new(config)
        .run()
        .await
        .context("Flash failed")?;

    tracing::info!(
        bytes_written = report.bytes_written,
        checksum = %report.checksum,
        succeeded = ?report.succeeded,
        failed = ?report.failed,
        "Done"
    );

    if !report.failed.is_empty() {
        anyhow::bail!("{} destination(s) failed", report.failed.len());
    }
    Ok(())
}
