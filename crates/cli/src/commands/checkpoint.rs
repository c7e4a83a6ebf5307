//! Checkpoint command - inspect stored checkpoints

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use telemetry_config::AppConfig;
use telemetry_processor::state::{CheckpointStore, PipelineSnapshot};

#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointCommand {
    /// Show the latest checkpoint of a directory
    #[command(name = "inspect")]
    Inspect {
        /// Checkpoint directory; defaults to the configured one
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

impl CheckpointCommand {
    pub async fn execute(&self, config: Option<&AppConfig>) -> Result<()> {
        match self {
            CheckpointCommand::Inspect { dir, json } => {
                let Some(dir) = dir
                    .clone()
                    .or_else(|| config.and_then(|c| c.processor.checkpoint_dir.clone()))
                else {
                    bail!("no checkpoint directory given or configured");
                };

                let store = CheckpointStore::new(&dir, 1);
                let Some(snapshot) = store.latest().await? else {
                    println!("{} {}", "No checkpoint in".yellow(), dir.display());
                    return Ok(());
                };

                if *json {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                } else {
                    print_snapshot(&snapshot);
                }
                Ok(())
            }
        }
    }
}

fn print_snapshot(snapshot: &PipelineSnapshot) {
    println!(
        "{} {}",
        "Checkpoint".bold().cyan(),
        snapshot.checkpoint_id.to_string().bold()
    );
    println!("{}", "-".repeat(40));

    let token = snapshot.resume_token().to_string();
    println!(
        "  Resume token:     {}",
        if token.is_empty() { "none".dimmed().to_string() } else { token }
    );
    println!("  Watermark:        {}", snapshot.watermark().timestamp);
    println!("  Buffered events:  {}", snapshot.buffered_event_count());

    println!();
    println!("{}", "Sources".bold());
    for source in &snapshot.sources {
        let offset = source
            .next_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  partition {:<4} next offset {}", source.partition, offset);
    }

    println!();
    println!("{}", "Queries".bold());
    for query in &snapshot.queries {
        println!(
            "  {:<16} {} open windows",
            query.metric.to_string().green(),
            query.windows.len()
        );
    }
}
