// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Append-only audit trail of file state transitions (JSON lines).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::task::{FileState, FileTask, TransitionError};

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: u64,
    pub file: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

#[derive(Debug)]
pub struct AuditTrail {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditTrail {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit trail {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advance `task` to `to` and record the transition.
    pub fn transition(
        &self,
        task: &mut FileTask,
        to: FileState,
        detail: &str,
    ) -> Result<(), TransitionError> {
        let from = task.advance(to).inspect_err(|e| error!("{e}"))?;

        if detail.is_empty() {
            info!("[{}] {}: {from} -> {to}", task.id, task.name());
        } else {
            info!("[{}] {}: {from} -> {to} ({detail})", task.id, task.name());
        }

        self.append(&AuditEntry {
            timestamp: Utc::now(),
            task_id: task.id,
            file: task.name(),
            from: from.to_string(),
            to: to.to_string(),
            detail: detail.to_string(),
        });
        Ok(())
    }

    /// Record an outcome that is not a state change (skips, rejections).
    pub fn note(&self, file: &str, outcome: &str, detail: &str) {
        info!("{file}: {outcome} ({detail})");
        self.append(&AuditEntry {
            timestamp: Utc::now(),
            task_id: 0,
            file: file.to_string(),
            from: FileState::Discovered.to_string(),
            to: outcome.to_string(),
            detail: detail.to_string(),
        });
    }

    /// Write failures are logged; the trail never stops the pipeline.
    fn append(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                warn!("Audit: failed to serialize entry: {e}");
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Audit: failed to write {}: {e}", self.path.display());
        }
    }
}

/// Read back all entries of an audit trail.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Malformed audit entry"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn transitions_are_appended_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/audit.jsonl");
        let audit = AuditTrail::open(&path).unwrap();

        let mut task = FileTask::new(PathBuf::from("/in/x.pdf"), PathBuf::from("x.pdf"), 4);
        audit.transition(&mut task, FileState::Admitted, "").unwrap();
        audit
            .transition(&mut task, FileState::Staged, "digest abc")
            .unwrap();
        audit.note("y.part", "ignored", "matches ignore pattern");

        let entries = read_entries(&path).unwrap();
        let steps: Vec<_> = entries
            .iter()
            .map(|e| (e.file.as_str(), e.from.as_str(), e.to.as_str()))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("x.pdf", "Discovered", "Admitted"),
                ("x.pdf", "Admitted", "Staged"),
                ("y.part", "Discovered", "ignored"),
            ]
        );
        assert_eq!(entries[1].detail, "digest abc");
        assert_eq!(entries[0].task_id, task.id);
    }

    #[test]
    fn illegal_transition_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = AuditTrail::open(&path).unwrap();

        let mut task = FileTask::new(PathBuf::from("/in/x"), PathBuf::from("x"), 1);
        assert!(audit.transition(&mut task, FileState::Delivered, "").is_err());
        assert_eq!(task.state(), FileState::Discovered);
        assert!(read_entries(&path).unwrap().is_empty());
    }

    #[test]
    fn reopening_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        AuditTrail::open(&path).unwrap().note("a", "skipped", "");
        AuditTrail::open(&path).unwrap().note("b", "skipped", "");
        assert_eq!(read_entries(&path).unwrap().len(), 2);
    }
}
