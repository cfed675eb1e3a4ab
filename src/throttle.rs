// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Admission control based on free disk space and volume/count quotas.
//!
//! The quota check and the counter increment happen under one lock, so
//! concurrent admissions are totally ordered and can never both pass
//! against the same counter value.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{Local, NaiveDate};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::util::{read_json, write_json_atomic};

// =============================================================================
// Disk Space
// =============================================================================

/// Source of free space figures for the staging volume.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged users on the filesystem holding `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs(2)` based probe.
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let st = rustix::fs::statvfs(path)?;
        Ok(st.f_bavail.saturating_mul(st.f_frsize))
    }
}

// =============================================================================
// Types
// =============================================================================

/// Throttling thresholds. Zero quotas mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleLimits {
    /// Free space that must remain on the staging volume after admission.
    pub min_free_bytes: u64,
    pub run_max_bytes: u64,
    pub run_max_files: u64,
    pub daily_max_bytes: u64,
    pub daily_max_files: u64,
}

/// Counters shared by all workers of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleState {
    pub run_bytes: u64,
    pub run_files: u64,
    pub day_bytes: u64,
    pub day_files: u64,
    /// Local calendar day the daily counters belong to.
    pub day: NaiveDate,
    /// Admitted but not yet finalized.
    pub in_flight_bytes: u64,
    pub delivered_bytes: u64,
    pub delivered_files: u64,
}

impl ThrottleState {
    fn new(day: NaiveDate) -> Self {
        Self {
            run_bytes: 0,
            run_files: 0,
            day_bytes: 0,
            day_files: 0,
            day,
            in_flight_bytes: 0,
            delivered_bytes: 0,
            delivered_files: 0,
        }
    }
}

/// Persisted daily counters.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyFile {
    day: NaiveDate,
    bytes: u64,
    files: u64,
}

/// Proof of admission; must be finalized or rolled back exactly once.
#[derive(Debug)]
#[must_use]
pub struct Admission {
    bytes: u64,
    day: NaiveDate,
}

impl Admission {
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Result of an admission attempt.
#[derive(Debug)]
pub enum AdmitDecision {
    Admitted(Admission),
    RejectedDiskSpace { free: u64, required: u64 },
    RejectedRunQuota,
    RejectedDailyQuota,
}

impl AdmitDecision {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Admitted(_) => "admitted",
            Self::RejectedDiskSpace { .. } => "rejected-disk-space",
            Self::RejectedRunQuota => "rejected-run-quota",
            Self::RejectedDailyQuota => "rejected-daily-quota",
        }
    }
}

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

// =============================================================================
// Throttler
// =============================================================================

pub struct Throttler {
    limits: ThrottleLimits,
    probe: Box<dyn SpaceProbe>,
    staging: PathBuf,
    state_path: Option<PathBuf>,
    today: Clock,
    state: Mutex<ThrottleState>,
}

impl Throttler {
    /// Create a throttler, restoring today's counters from `state_path` if present.
    pub fn open(
        limits: ThrottleLimits,
        probe: Box<dyn SpaceProbe>,
        staging: PathBuf,
        state_path: Option<PathBuf>,
    ) -> Result<Self> {
        Self::with_clock(
            limits,
            probe,
            staging,
            state_path,
            Box::new(|| Local::now().date_naive()),
        )
    }

    pub fn with_clock(
        limits: ThrottleLimits,
        probe: Box<dyn SpaceProbe>,
        staging: PathBuf,
        state_path: Option<PathBuf>,
        today: Clock,
    ) -> Result<Self> {
        let day = today();
        let mut state = ThrottleState::new(day);

        if let Some(path) = &state_path {
            if let Some(saved) = read_json::<DailyFile>(path)? {
                if saved.day == day {
                    state.day_bytes = saved.bytes;
                    state.day_files = saved.files;
                    info!(
                        "Throttle: restored daily counters ({} files, {} bytes)",
                        saved.files, saved.bytes
                    );
                } else {
                    debug!("Throttle: saved counters are from {}, starting fresh", saved.day);
                }
            }
        }

        Ok(Self {
            limits,
            probe,
            staging,
            state_path,
            today,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset daily counters when the calendar day changed. Runs under the
    /// state lock, so only the first caller after the boundary resets.
    fn roll_over(&self, state: &mut ThrottleState) {
        let today = (self.today)();
        if today != state.day {
            info!(
                "Throttle: day rolled over {} -> {today} (resetting {} files, {} bytes)",
                state.day, state.day_files, state.day_bytes
            );
            state.day = today;
            state.day_bytes = 0;
            state.day_files = 0;
        }
    }

    /// Check and, on success, count a candidate of `size` bytes.
    pub fn try_admit(&self, size: u64) -> AdmitDecision {
        let mut state = self.lock();
        self.roll_over(&mut state);

        let free = self.probe.free_bytes(&self.staging).unwrap_or_else(|e| {
            warn!(
                "Throttle: cannot read free space on {}: {e}",
                self.staging.display()
            );
            0
        });
        let required = self
            .limits
            .min_free_bytes
            .saturating_add(state.in_flight_bytes)
            .saturating_add(size);
        if free < required {
            return AdmitDecision::RejectedDiskSpace { free, required };
        }

        let l = &self.limits;
        if exceeds(l.run_max_bytes, state.run_bytes, size)
            || exceeds(l.run_max_files, state.run_files, 1)
        {
            return AdmitDecision::RejectedRunQuota;
        }
        if exceeds(l.daily_max_bytes, state.day_bytes, size)
            || exceeds(l.daily_max_files, state.day_files, 1)
        {
            return AdmitDecision::RejectedDailyQuota;
        }

        state.run_bytes += size;
        state.run_files += 1;
        state.day_bytes += size;
        state.day_files += 1;
        state.in_flight_bytes += size;

        AdmitDecision::Admitted(Admission {
            bytes: size,
            day: state.day,
        })
    }

    /// Release the in-flight reservation of a file that reached a terminal
    /// state. Quota stays consumed; only delivered files count as delivered.
    pub fn finalize(&self, admission: Admission, delivered: bool) {
        let mut state = self.lock();
        state.in_flight_bytes = state.in_flight_bytes.saturating_sub(admission.bytes);
        if delivered {
            state.delivered_bytes += admission.bytes;
            state.delivered_files += 1;
        }
    }

    /// Undo an admission for a file that will be processed again later.
    pub fn rollback(&self, admission: Admission) {
        let mut state = self.lock();
        state.in_flight_bytes = state.in_flight_bytes.saturating_sub(admission.bytes);
        state.run_bytes = state.run_bytes.saturating_sub(admission.bytes);
        state.run_files = state.run_files.saturating_sub(1);
        if admission.day == state.day {
            state.day_bytes = state.day_bytes.saturating_sub(admission.bytes);
            state.day_files = state.day_files.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ThrottleState {
        self.lock().clone()
    }

    /// Persist daily counters.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let daily = {
            let state = self.lock();
            DailyFile {
                day: state.day,
                bytes: state.day_bytes,
                files: state.day_files,
            }
        };
        write_json_atomic(path, &daily)
    }
}

/// `limit > 0 && used + add > limit`
const fn exceeds(limit: u64, used: u64, add: u64) -> bool {
    limit > 0 && used.saturating_add(add) > limit
}
