mod auth;
mod cli;
mod config;
mod error;
mod extractor;
mod orchestrator;
mod output;
mod poller;
mod recorder;
mod records;
mod server;
mod tracker;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting FlowMetrix - Pipeline stage metrics exporter");
    cli.execute().await?;

    Ok(())
}
