use anyhow::Result;
use clap::Parser as ClapParser;
use colored::*;
use tokio::io::BufReader;
use tracing::{info, warn};
use worker_catalog::{
    init_tracing, Config, LimitedClient, LogBuffer, ProcessWorkerFactory, WorkerCatalog,
};

mod cli;
mod console;

use cli::Args;
use console::Console;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logs = LogBuffer::new();
    init_tracing(&args.log_level, logs.clone());

    let config = Config::load(args.config.as_deref())?;
    info!("Starting session analyzer v{}", env!("CARGO_PKG_VERSION"));

    let client = LimitedClient::new(config.limiter.build()?);
    info!(
        "Outbound worker calls limited to {} at a time",
        client.limiter().capacity()
    );
    let factory = ProcessWorkerFactory::new(config.worker.clone(), client);
    if !factory.is_available() {
        warn!(
            "Worker command '{}' not found in PATH; starts will fail until it is installed",
            config.worker.command
        );
    }

    let catalog = WorkerCatalog::with_config(factory, config.catalog.clone());
    println!(
        "{} type 'help' for commands",
        "Session analyzer ready:".bold().green()
    );

    Console::new(catalog, logs)
        .run(BufReader::new(tokio::io::stdin()))
        .await
}
