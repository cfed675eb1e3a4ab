// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine self-test: checks that an engine's output is still understood by
//! its adapter, and records the result for the installed version.
//!
//! An engine passes when the EICAR test file is reported suspect and a
//! benign file is reported clean.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::ledger::{LedgerError, ScannerVersionRecord, VersionLedger};
use crate::scanner::{
    CombinePolicy, ScanEngine, ScanOrchestrator, ScanPolicy, ScanVerdict, VERSION_PROBE_TIMEOUT,
    detect_version,
};
use crate::status::PipelineStatus;

/// EICAR anti-malware test file.
pub const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

const BENIGN: &[u8] = b"quarantine-gate self-test: this file is harmless\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestResult {
    pub engine: String,
    pub version: Option<String>,
    pub passed: bool,
    pub summary: String,
}

/// Scan the EICAR and benign samples in `workdir` with `engine`.
pub async fn self_test(
    engine: Arc<dyn ScanEngine>,
    policy: ScanPolicy,
    workdir: &Path,
) -> Result<SelfTestResult> {
    let name = engine.name().to_string();
    let eicar = workdir.join("eicar.com");
    let benign = workdir.join("benign.txt");
    fs::write(&eicar, EICAR).with_context(|| format!("Failed to write {}", eicar.display()))?;
    fs::write(&benign, BENIGN).with_context(|| format!("Failed to write {}", benign.display()))?;

    let version = detect_version(engine.as_ref(), VERSION_PROBE_TIMEOUT).await;
    let orchestrator = ScanOrchestrator::new(vec![engine], policy, CombinePolicy::AllClean);
    let cancel = CancellationToken::new();

    let detected = orchestrator
        .scan(&eicar, EICAR.len() as u64, &cancel)
        .await?
        .verdict;
    let clean = orchestrator
        .scan(&benign, BENIGN.len() as u64, &cancel)
        .await?
        .verdict;

    let passed = matches!(detected, ScanVerdict::Suspect(_)) && clean == ScanVerdict::Clean;
    let summary = format!(
        "eicar: {}, benign: {}",
        detected.label(),
        clean.label()
    );

    if passed {
        info!("{name} {}: self-test passed ({summary})", version.as_deref().unwrap_or("?"));
    } else {
        error!("{name} {}: self-test failed ({summary})", version.as_deref().unwrap_or("?"));
    }

    Ok(SelfTestResult {
        engine: name,
        version,
        passed,
        summary,
    })
}

/// Record a self-test result in the ledger and the status file.
///
/// Results without a detectable version are not recorded. An existing
/// record for the same version is left unchanged, and the status file
/// follows the stored record rather than this run.
///
/// Returns whether the live version is recorded as tested.
pub fn record_result(
    result: &SelfTestResult,
    ledger: &mut VersionLedger,
    status_path: &Path,
) -> Result<bool> {
    let Some(version) = &result.version else {
        warn!("{}: version not detectable, nothing recorded", result.engine);
        return Ok(false);
    };

    match ledger.record(ScannerVersionRecord {
        engine: result.engine.clone(),
        version: version.clone(),
        tested: result.passed,
        tested_at: Utc::now(),
        result: result.summary.clone(),
    }) {
        Ok(()) => {}
        Err(LedgerError::Duplicate { .. }) => {
            warn!("{} {version}: already recorded, keeping existing record", result.engine);
        }
        Err(e) => return Err(e.into()),
    }

    let tested = ledger
        .lookup(&result.engine, version)
        .is_some_and(|record| record.tested);
    if tested != result.passed {
        warn!(
            "{} {version}: ledger records tested={tested}, this run {}",
            result.engine,
            if result.passed { "passed" } else { "failed" }
        );
    }

    let mut status = PipelineStatus::load(status_path)?;
    status.record_self_test(&result.engine, version, tested);
    status.save(status_path)?;
    Ok(tested)
}
