// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use quarantine_gate::config::{PipelineConfig, verify_config};
use quarantine_gate::pipeline::Coordinator;
use quarantine_gate::status::PipelineStatus;
use quarantine_gate::util::{init_logger, wait_for_shutdown};

#[derive(Parser)]
#[command(name = "quarantine-gate")]
#[command(about = "Version-gated malware scanning and quarantine pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Process the inbound directory once
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        debug: bool,
    },
    /// Verify configuration file without running the pipeline
    Verify {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the persisted scanner status
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, debug } => {
            init_logger(debug)?;

            let config = PipelineConfig::load(&config).with_context(|| {
                format!("Failed to load configuration from {}", config.display())
            })?;

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                match wait_for_shutdown().await {
                    Ok(signal) => {
                        info!("Shutdown requested ({signal:?})");
                        trigger.cancel();
                    }
                    Err(e) => error!("Signal handling failed: {e}"),
                }
            });

            let summary = Coordinator::new(config)
                .run(&cancel)
                .await
                .context("Pipeline refused to start")?;

            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Verify { config } => verify_config(&config)
            .with_context(|| format!("Failed to verify configuration file {}", config.display())),
        Commands::Status { config } => {
            let config = PipelineConfig::load(&config)?;
            let status = PipelineStatus::load(&config.status_path())?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}
