// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-file work item and its lifecycle state machine.
//!
//! ```text
//! Discovered -> Admitted -> Staged -> Scanning -> Clean | Suspect | ScanFailed
//! Clean      -> Delivered | DeleteFailed
//! Suspect    -> Quarantined -> Archived
//! ScanFailed -> Retrying -> Scanning
//! ScanFailed -> ReportedFailed
//! ```
//!
//! Shutdown may move an unfinished task back to `Staged` or `Admitted` so a
//! later run restarts it from a safe point.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::integrity::Digest;
use crate::scanner::ScanVerdict;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileState {
    Discovered,
    Admitted,
    Staged,
    Scanning,
    Clean,
    Suspect,
    ScanFailed,
    Retrying,
    Delivered,
    DeleteFailed,
    Quarantined,
    Archived,
    ReportedFailed,
}

impl FileState {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_advance(self, to: Self) -> bool {
        use FileState::{
            Admitted, Archived, Clean, DeleteFailed, Delivered, Discovered, Quarantined,
            ReportedFailed, Retrying, ScanFailed, Scanning, Staged, Suspect,
        };
        matches!(
            (self, to),
            (Discovered, Admitted)
                | (Admitted, Staged)
                | (Staged, Scanning)
                | (Scanning, Clean | Suspect | ScanFailed)
                | (Clean, Delivered | DeleteFailed)
                | (Suspect, Quarantined)
                | (Quarantined, Archived)
                | (ScanFailed, Retrying | ReportedFailed)
                | (Retrying, Scanning)
                // Shutdown rollback
                | (Scanning | Retrying, Staged)
                | (Staged, Admitted)
        )
    }

    /// No further transitions follow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::DeleteFailed | Self::Archived | Self::ReportedFailed
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id} ({file}): illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub task_id: u64,
    pub file: String,
    pub from: FileState,
    pub to: FileState,
}

/// One candidate file travelling through the pipeline.
#[derive(Debug)]
pub struct FileTask {
    pub id: u64,
    /// Original file in the inbound area.
    pub source: PathBuf,
    /// Path relative to the inbound root, preserved at the destination.
    pub relative: PathBuf,
    pub staged: Option<PathBuf>,
    pub size: u64,
    /// Digest of the staged copy, set once staging completed.
    pub digest: Option<Digest>,
    pub verdict: Option<ScanVerdict>,
    pub retry_count: u32,
    state: FileState,
}

impl FileTask {
    #[must_use]
    pub fn new(source: PathBuf, relative: PathBuf, size: u64) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            source,
            relative,
            staged: None,
            size,
            digest: None,
            verdict: None,
            retry_count: 0,
            state: FileState::Discovered,
        }
    }

    #[must_use]
    pub const fn state(&self) -> FileState {
        self.state
    }

    /// Display name used in logs, alerts and the audit trail.
    #[must_use]
    pub fn name(&self) -> String {
        self.relative.display().to_string()
    }

    /// Move to `to`, returning the previous state.
    pub fn advance(&mut self, to: FileState) -> Result<FileState, TransitionError> {
        if !self.state.can_advance(to) {
            return Err(TransitionError {
                task_id: self.id,
                file: self.name(),
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}
