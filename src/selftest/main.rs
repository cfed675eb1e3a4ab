// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use quarantine_gate::config::PipelineConfig;
use quarantine_gate::ledger::VersionLedger;
use quarantine_gate::selftest::{record_result, self_test};
use quarantine_gate::util::init_logger;

/// Self-test every configured scanner engine and record the result for its
/// installed version in the version ledger.
#[derive(Parser)]
#[command(name = "scanner-selftest")]
#[command(about = "Verify scanner engines against known samples and update the version ledger")]
struct Cli {
    #[arg(short, long)]
    config: PathBuf,
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug)?;

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let mut ledger = VersionLedger::open_or_create(&config.ledger_path())?;
    let workdir = tempfile::TempDir::new().context("Failed to create work directory")?;

    let mut failed = Vec::new();
    for engine in config.build_engines() {
        let result = self_test(engine, config.scan_policy(), workdir.path()).await?;
        let tested = record_result(&result, &mut ledger, &config.status_path())?;

        let version = result.version.as_deref().unwrap_or("unknown");
        let state = match (result.passed, tested) {
            (true, true) => "passed",
            (true, false) => "passed, but the ledger records this version as untested",
            (false, _) => "FAILED",
        };
        eprintln!("{} {version}: {state} ({})", result.engine, result.summary);
        if !(result.passed && tested) {
            failed.push(result.engine);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Self-test failed for: {}", failed.join(", "));
    }

    info!("scanner-selftest: all engines passed");
    Ok(())
}
