//! Game telemetry aggregator CLI
//!
//! Runs the per-minute metrics pipeline and inspects its checkpoints.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{CheckpointCommand, RunArgs};
use std::path::PathBuf;
use telemetry_config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "telemetry-aggregator",
    version,
    about = "Aggregates game telemetry events into per-minute metrics"
)]
struct Cli {
    /// Properties file; defaults to the file of the current run mode
    #[arg(short, long, global = true, value_name = "FILE", env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(long, global = true, value_name = "FILTER", env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the aggregation pipeline (default)
    #[command(name = "run")]
    Run(RunArgs),

    /// Checkpoint operations
    #[command(name = "checkpoint")]
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Checkpoint { command }) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"), cli.json_logs);
            // Only needed for the default directory
            let config = if cli.config.is_some() {
                Some(AppConfig::load(cli.config)?)
            } else {
                None
            };
            command.execute(config.as_ref()).await
        }
        command => {
            let config = AppConfig::load(cli.config)?;
            let level = cli
                .log_level
                .unwrap_or_else(|| config.observability.log_level.clone());
            init_tracing(&level, cli.json_logs || config.observability.json_logging);

            let args = match command {
                Some(Commands::Run(args)) => args,
                _ => RunArgs::default(),
            };
            args.execute(config).await
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(filter: &str, json: bool) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_is_default() {
        let cli = Cli::try_parse_from(["telemetry-aggregator"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from([
            "telemetry-aggregator",
            "run",
            "--starting-position",
            "earliest",
            "--metrics-port",
            "9090",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.starting_position.as_deref(), Some("earliest"));
                assert_eq!(args.metrics_port, Some(9090));
            }
            _ => panic!("expected run command"),
        }
    }
}
