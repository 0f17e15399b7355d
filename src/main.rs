use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_datagen::clock::SystemClock;
use agent_datagen::config::{AppConfig, LoggingConfig};
use agent_datagen::pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging);

    info!("🚀 agent-datagen v{}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config.digest());

    config.validate()?;

    let pipeline = Pipeline::new(config, Arc::new(SystemClock));
    let reports = pipeline.run().await?;

    for report in &reports {
        info!("{}", report);
    }
    info!("🏁 Done, {} stage(s) run", reports.len());
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
