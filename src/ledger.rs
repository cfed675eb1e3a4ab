// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Version ledger: which scanner engine versions passed the offline self-test.
//!
//! The pipeline only reads the ledger. Records are appended by the
//! `scanner-selftest` tool and are immutable per (engine, version) pair.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::util::{read_json, write_json_atomic};

/// Self-test outcome for one engine version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerVersionRecord {
    pub engine: String,
    pub version: String,
    pub tested: bool,
    pub tested_at: DateTime<Utc>,
    /// Human readable summary of the self-test.
    pub result: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    records: Vec<ScannerVersionRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("version ledger not found: {0}")]
    Missing(PathBuf),
    #[error("ledger already holds a record for {engine} {version}")]
    Duplicate { engine: String, version: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// On-disk ledger of tested engine versions.
#[derive(Debug)]
pub struct VersionLedger {
    path: PathBuf,
    records: Vec<ScannerVersionRecord>,
}

impl VersionLedger {
    /// Open an existing ledger. A missing file is an error: the pipeline
    /// must not run without one.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let file = read_json::<LedgerFile>(path)?
            .ok_or_else(|| LedgerError::Missing(path.to_path_buf()))?;
        debug!(
            "Loaded version ledger {} ({} records)",
            path.display(),
            file.records.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            records: file.records,
        })
    }

    /// Open a ledger, starting an empty one if it does not exist yet.
    pub fn open_or_create(path: &Path) -> Result<Self, LedgerError> {
        let file: LedgerFile = read_json(path)?.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            records: file.records,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn records(&self) -> &[ScannerVersionRecord] {
        &self.records
    }

    #[must_use]
    pub fn lookup(&self, engine: &str, version: &str) -> Option<&ScannerVersionRecord> {
        self.records
            .iter()
            .find(|r| r.engine == engine && r.version == version)
    }

    /// Most recent record for `engine` whose self-test passed.
    #[must_use]
    pub fn latest_tested(&self, engine: &str) -> Option<&ScannerVersionRecord> {
        self.records
            .iter()
            .filter(|r| r.engine == engine && r.tested)
            .max_by_key(|r| r.tested_at)
    }

    /// Append a record and persist the ledger.
    pub fn record(&mut self, record: ScannerVersionRecord) -> Result<(), LedgerError> {
        if self.lookup(&record.engine, &record.version).is_some() {
            return Err(LedgerError::Duplicate {
                engine: record.engine,
                version: record.version,
            });
        }

        info!(
            "Ledger: recording {} {} (tested={}, {})",
            record.engine, record.version, record.tested, record.result
        );
        self.records.push(record);

        let file = LedgerFile {
            records: self.records.clone(),
        };
        write_json_atomic(&self.path, &file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn rec(engine: &str, version: &str, tested: bool, day: u32) -> ScannerVersionRecord {
        ScannerVersionRecord {
            engine: engine.to_string(),
            version: version.to_string(),
            tested,
            tested_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
            result: "eicar detected, benign clean".to_string(),
        }
    }

    #[test]
    fn open_missing_ledger_fails() {
        let dir = TempDir::new().unwrap();
        assert_matches!(
            VersionLedger::open(&dir.path().join("ledger.json")),
            Err(LedgerError::Missing(_))
        );
    }

    #[test]
    fn record_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");

        let mut ledger = VersionLedger::open_or_create(&path).unwrap();
        ledger.record(rec("clamscan", "1.0.3", true, 1)).unwrap();

        let reloaded = VersionLedger::open(&path).unwrap();
        assert_eq!(reloaded.records().len(), 1);
        assert!(reloaded.lookup("clamscan", "1.0.3").is_some());
        assert!(reloaded.lookup("clamscan", "1.0.4").is_none());
    }

    #[test]
    fn records_are_immutable_per_version() {
        let dir = TempDir::new().unwrap();
        let mut ledger = VersionLedger::open_or_create(&dir.path().join("ledger.json")).unwrap();
        ledger.record(rec("savscan", "101.0", true, 1)).unwrap();

        assert_matches!(
            ledger.record(rec("savscan", "101.0", false, 2)),
            Err(LedgerError::Duplicate { .. })
        );
        assert!(ledger.lookup("savscan", "101.0").unwrap().tested);
    }

    #[test]
    fn latest_tested_skips_failed_records() {
        let dir = TempDir::new().unwrap();
        let mut ledger = VersionLedger::open_or_create(&dir.path().join("ledger.json")).unwrap();
        ledger.record(rec("savscan", "101.0", true, 1)).unwrap();
        ledger.record(rec("savscan", "101.1", false, 5)).unwrap();
        ledger.record(rec("clamscan", "1.0.3", true, 9)).unwrap();

        let latest = ledger.latest_tested("savscan").unwrap();
        assert_eq!(latest.version, "101.0");
        assert!(ledger.latest_tested("other").is_none());
    }
}
