use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ferry_common::config::AppConfig;
use ferry_common::runtime::RuntimeManager;
use ferry_telemetry::telemetry::{init_telemetry, shutdown_telemetry};

use crate::handler::EchoHandler;

#[derive(Parser)]
#[command(version, name = "ferry", about = "Multi-tenant query scheduling")]
struct Cli {
    /// The TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the scheduler.
    Scheduler,
    /// Runs a querier that pulls requests from the schedulers.
    Querier,
    /// Runs a scheduler and a querier in the same process.
    Standalone,
}

pub fn main(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_from(args);
    let config = AppConfig::load(cli.config.as_deref())?;
    let runtime = RuntimeManager::try_new(&config.runtime)?;

    runtime
        .handle()
        .block_on(async { init_telemetry(&config.telemetry) })?;

    let result = runtime.block_on(async {
        match cli.command {
            Command::Scheduler => ferry_scheduling::run_scheduler(&config).await,
            Command::Querier => {
                ferry_scheduling::run_querier(&config, Arc::new(EchoHandler)).await
            }
            Command::Standalone => {
                ferry_scheduling::run_standalone(&config, Arc::new(EchoHandler)).await
            }
        }
    });

    shutdown_telemetry();
    result
}
