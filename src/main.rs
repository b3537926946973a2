mod attributes;
mod auth;
mod cli;
mod config;
mod error;
mod exporter;
mod providers;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting gitlab-otel-exporter");
    cli.execute().await?;

    Ok(())
}
