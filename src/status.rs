// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Status gate: fail-closed startup check comparing the live engine versions
//! with the versions recorded as tested in the ledger.
//!
//! The check runs once per pipeline invocation. The detected versions are
//! persisted to the status file even when the gate fails, for operators.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::ledger::VersionLedger;
use crate::scanner::{ScanEngine, detect_version};
use crate::util::{read_json, write_json_atomic};

/// Per-engine version view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub tested_version: Option<String>,
    pub detected_version: Option<String>,
}

impl EngineStatus {
    fn is_ready(&self) -> bool {
        matches!(
            (&self.tested_version, &self.detected_version),
            (Some(tested), Some(detected)) if tested == detected
        )
    }
}

/// Process-wide readiness record, persisted for operator visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub ready: bool,
    pub last_startup: Option<DateTime<Utc>>,
    pub reason: String,
    pub engines: BTreeMap<String, EngineStatus>,
}

impl PipelineStatus {
    /// Load the status file, or an empty status if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_json::<Self>(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Recompute `ready` from the engine entries.
    fn refresh_ready(&mut self) {
        self.ready = !self.engines.is_empty() && self.engines.values().all(EngineStatus::is_ready);
    }

    /// Record a completed self-test for `engine`.
    pub fn record_self_test(&mut self, engine: &str, version: &str, passed: bool) {
        let entry = self.engines.entry(engine.to_string()).or_default();
        entry.detected_version = Some(version.to_string());
        if passed {
            entry.tested_version = Some(version.to_string());
        }
        self.refresh_ready();
    }
}

/// Outcome of the startup check.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub ready: bool,
    /// Names every engine that failed the check, or "ready".
    pub reason: String,
    pub status: PipelineStatus,
}

/// Compare live engine versions with the ledger and persist the result.
pub async fn check_ready(
    engines: &[Arc<dyn ScanEngine>],
    ledger: &VersionLedger,
    status_path: &Path,
    probe_timeout: Duration,
) -> Result<GateReport> {
    let detected = join_all(
        engines
            .iter()
            .map(|engine| detect_version(engine.as_ref(), probe_timeout)),
    )
    .await;

    let mut status = PipelineStatus {
        last_startup: Some(Utc::now()),
        ..PipelineStatus::default()
    };
    let mut problems = Vec::new();

    if engines.is_empty() {
        problems.push("no scanner engines enabled".to_string());
    }

    for (engine, live) in engines.iter().zip(detected) {
        let name = engine.name();
        let latest = ledger.latest_tested(name).map(|r| r.version.clone());

        let tested = match &live {
            Some(version) if ledger.lookup(name, version).is_some_and(|r| r.tested) => {
                Some(version.clone())
            }
            _ => latest,
        };

        match (&live, &tested) {
            (None, _) => problems.push(format!("engine {name}: installed version not detectable")),
            (Some(version), None) => problems.push(format!(
                "engine {name}: version {version} is untested (no self-test recorded)"
            )),
            (Some(version), Some(tested)) if version != tested => problems.push(format!(
                "engine {name}: detected version {version} differs from tested version {tested}"
            )),
            _ => {}
        }

        status.engines.insert(
            name.to_string(),
            EngineStatus {
                tested_version: tested,
                detected_version: live,
            },
        );
    }

    status.refresh_ready();
    let ready = status.ready && problems.is_empty();
    status.ready = ready;
    status.reason = if ready {
        "ready".to_string()
    } else {
        problems.join("; ")
    };

    status.save(status_path)?;

    if ready {
        info!("Status gate: ready ({} engines)", status.engines.len());
    } else {
        error!("Status gate: not ready: {}", status.reason);
    }

    Ok(GateReport {
        ready,
        reason: status.reason.clone(),
        status,
    })
}
