// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Pipeline coordinator: startup gating, candidate enumeration, admission
//! and dispatch to a bounded worker pool.
//!
//! Admission runs on the coordinator alone, in enumeration order. Each
//! admitted file is then processed end-to-end by one worker:
//! stage, scan, route, finalize.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveKeyError, ArchivePublicKey, HazardArchive};
use crate::audit::AuditTrail;
use crate::config::PipelineConfig;
use crate::ledger::{LedgerError, VersionLedger};
use crate::notify::{AlertCategory, Notifier};
use crate::quarantine::{Areas, Outcome, QuarantineManager};
use crate::scanner::{
    RetryObserver, ScanCancelled, ScanOrchestrator, ScanVerdict, VERSION_PROBE_TIMEOUT,
};
use crate::status::check_ready;
use crate::task::{FileState, FileTask};
use crate::throttle::{AdmitDecision, Admission, SpaceProbe, StatvfsProbe, Throttler};
use crate::util::{is_safe_relative_path, matches_ignore_pattern};

/// Time allowed for queued alerts at the end of a run.
const NOTIFY_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that stop the pipeline before any file is admitted.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    ArchiveKey(#[from] ArchiveKeyError),
    #[error("scanner status gate not ready: {reason}")]
    NotReady { reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-outcome counts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub discovered: u64,
    pub delivered: u64,
    /// Bytes that reached the destination.
    pub delivered_bytes: u64,
    pub delete_failed: u64,
    pub quarantined: u64,
    pub archived: u64,
    pub failed: u64,
    pub rejected_disk_space: u64,
    pub rejected_run_quota: u64,
    pub rejected_daily_quota: u64,
    pub skipped_ignored: u64,
    pub skipped_unsafe: u64,
    pub skipped_delivered: u64,
    /// Admitted but returned to a safe point (shutdown or staging error).
    pub deferred: u64,
}

impl RunSummary {
    fn record(&mut self, result: TaskResult) {
        match result {
            TaskResult::Finished(Outcome::Delivered) => self.delivered += 1,
            TaskResult::Finished(Outcome::DeleteFailed { .. }) => self.delete_failed += 1,
            TaskResult::Finished(Outcome::Quarantined) => self.quarantined += 1,
            TaskResult::Finished(Outcome::Archived) => self.archived += 1,
            TaskResult::Finished(Outcome::ReportedFailed) | TaskResult::Error => self.failed += 1,
            TaskResult::Deferred => self.deferred += 1,
        }
    }
}

/// How a worker left a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskResult {
    Finished(Outcome),
    /// Rolled back; a later run picks the file up again.
    Deferred,
    /// Illegal transition; left where it was.
    Error,
}

/// A regular file found in the inbound area.
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    relative: PathBuf,
    size: u64,
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    config: PipelineConfig,
    probe: Box<dyn SpaceProbe>,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            probe: Box::new(StatvfsProbe),
        }
    }

    /// Replace the free space probe for the staging volume.
    #[must_use]
    pub fn with_space_probe(mut self, probe: Box<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Run the pipeline once over the inbound area.
    ///
    /// Returns before touching any file if the scanners are not verified.
    pub async fn run(self, cancel: &CancellationToken) -> Result<RunSummary, StartupError> {
        let config = self.config;
        config.validate().map_err(StartupError::InvalidConfig)?;
        config.log_config_info();

        let notifier = config.notify.build();
        let ledger = VersionLedger::open(&config.ledger_path())?;

        let archive = if config.archive.enable {
            let (Some(dir), Some(key)) = (&config.archive.path, &config.archive.public_key) else {
                return Err(StartupError::InvalidConfig(vec![
                    "archive path and public key required".to_string(),
                ]));
            };
            Some(HazardArchive::new(dir.clone(), ArchivePublicKey::load(key)?))
        } else {
            None
        };

        let engines = config.build_engines();
        let gate = check_ready(
            &engines,
            &ledger,
            &config.status_path(),
            VERSION_PROBE_TIMEOUT,
        )
        .await?;
        if !gate.ready {
            notifier.notify(AlertCategory::Startup, "status gate", &gate.reason);
            notifier.flush(NOTIFY_FLUSH_TIMEOUT).await;
            return Err(StartupError::NotReady {
                reason: gate.reason,
            });
        }

        for dir in [&config.staging, &config.destination, &config.quarantine] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let audit = Arc::new(AuditTrail::open(&config.audit_path())?);
        let throttler = Arc::new(Throttler::open(
            config.throttle,
            self.probe,
            config.staging.clone(),
            Some(config.throttle_path()),
        )?);
        let manager = Arc::new(QuarantineManager::new(
            Areas {
                staging: config.staging.clone(),
                destination: config.destination.clone(),
                quarantine: config.quarantine.clone(),
            },
            archive,
            config.delete_source_on_success,
            config.delete_on_admit,
            Arc::clone(&audit),
            notifier.clone(),
        ));
        let orchestrator = Arc::new(ScanOrchestrator::new(
            engines,
            config.scan_policy(),
            config.combine_policy,
        ));

        let candidates = enumerate(&config.inbound)?;
        info!(
            "quarantine-gate: {} candidates in {}",
            candidates.len(),
            config.inbound.display()
        );

        let mut summary = RunSummary::default();
        let semaphore = Arc::new(Semaphore::new(config.workers));
        let mut handles = Vec::new();
        let mut disk_alerted = false;

        for candidate in candidates {
            if cancel.is_cancelled() {
                info!("Shutdown requested, not admitting further files");
                break;
            }
            summary.discovered += 1;
            let name = candidate.relative.display().to_string();

            if matches_ignore_pattern(&candidate.relative, &config.ignore_file_patterns) {
                debug!("Ignoring {name}");
                summary.skipped_ignored += 1;
                continue;
            }
            if !is_safe_relative_path(&candidate.relative) {
                warn!("Path traversal in {name}, dropping");
                summary.skipped_unsafe += 1;
                continue;
            }
            if already_delivered(&manager, &candidate).await {
                audit.note(&name, "already-delivered", "identical content at destination");
                summary.skipped_delivered += 1;
                continue;
            }

            let admission = match throttler.try_admit(candidate.size) {
                AdmitDecision::Admitted(admission) => admission,
                AdmitDecision::RejectedDiskSpace { free, required } => {
                    let detail = format!("{free} bytes free, {required} required");
                    audit.note(&name, "rejected-disk-space", &detail);
                    if !disk_alerted {
                        notifier.notify(
                            AlertCategory::DiskSpace,
                            &config.staging.display().to_string(),
                            &detail,
                        );
                        disk_alerted = true;
                    }
                    summary.rejected_disk_space += 1;
                    continue;
                }
                decision @ (AdmitDecision::RejectedRunQuota
                | AdmitDecision::RejectedDailyQuota) => {
                    audit.note(&name, decision.label(), "deferred to a later run");
                    if matches!(decision, AdmitDecision::RejectedRunQuota) {
                        summary.rejected_run_quota += 1;
                    } else {
                        summary.rejected_daily_quota += 1;
                    }
                    continue;
                }
            };

            let mut task = FileTask::new(candidate.path, candidate.relative, candidate.size);
            if let Err(e) = audit.transition(&mut task, FileState::Admitted, "") {
                error!("{e}");
                throttler.rollback(admission);
                summary.record(TaskResult::Error);
                continue;
            }
            if let Err(e) = throttler.persist() {
                warn!("Failed to persist throttle counters: {e:#}");
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
                () = cancel.cancelled() => {
                    audit.note(&name, "deferred", "shutdown before dispatch");
                    throttler.rollback(admission);
                    summary.record(TaskResult::Deferred);
                    break;
                }
            };
            let Ok(permit) = permit else {
                throttler.rollback(admission);
                break;
            };

            let worker = Worker {
                manager: Arc::clone(&manager),
                orchestrator: Arc::clone(&orchestrator),
                throttler: Arc::clone(&throttler),
                notifier: notifier.clone(),
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(async move {
                let result = worker.process(task, admission).await;
                drop(permit);
                result
            }));
        }

        for result in join_all(handles).await {
            match result {
                Ok(result) => summary.record(result),
                Err(e) => {
                    error!("Worker panicked: {e}");
                    summary.record(TaskResult::Error);
                }
            }
        }

        if let Err(e) = throttler.persist() {
            warn!("Failed to persist throttle counters: {e:#}");
        }
        let totals = throttler.snapshot();
        summary.delivered_bytes = totals.delivered_bytes;
        info!(
            "quarantine-gate: {} files ({} bytes) reached the destination",
            totals.delivered_files, totals.delivered_bytes
        );
        notifier.flush(NOTIFY_FLUSH_TIMEOUT).await;

        info!("quarantine-gate: run complete: {summary:?}");
        Ok(summary)
    }
}

/// Destination already holds identical content for `candidate`.
async fn already_delivered(manager: &Arc<QuarantineManager>, candidate: &Candidate) -> bool {
    let manager = Arc::clone(manager);
    let (path, relative, size) = (
        candidate.path.clone(),
        candidate.relative.clone(),
        candidate.size,
    );
    tokio::task::spawn_blocking(move || manager.is_already_delivered(&path, &relative, size))
        .await
        .unwrap_or(false)
}

/// List regular files under `root` recursively, without following symlinks,
/// sorted by relative path.
fn enumerate(root: &Path) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<Candidate>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping {}: {e}", path.display());
                continue;
            }
        };

        if meta.is_dir() {
            walk(root, &path, out)?;
        } else if meta.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            out.push(Candidate {
                relative: relative.to_path_buf(),
                path,
                size: meta.len(),
            });
        } else {
            debug!("Skipping non-regular file {}", path.display());
        }
    }
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    manager: Arc<QuarantineManager>,
    orchestrator: Arc<ScanOrchestrator>,
    throttler: Arc<Throttler>,
    notifier: Notifier,
    cancel: CancellationToken,
}

/// Records engine retries as `ScanFailed -> Retrying -> Scanning`.
struct RetryAudit<'a> {
    task: &'a Mutex<FileTask>,
    audit: &'a AuditTrail,
}

impl RetryObserver for RetryAudit<'_> {
    fn retrying(&self, engine: &str, attempt: u32, verdict: &ScanVerdict) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        task.retry_count += 1;
        let detail = format!("{engine} attempt {attempt}: {}", verdict.label());
        for to in [FileState::ScanFailed, FileState::Retrying, FileState::Scanning] {
            if self.audit.transition(&mut task, to, &detail).is_err() {
                break;
            }
        }
    }
}

impl Worker {
    async fn process(self, task: FileTask, admission: Admission) -> TaskResult {
        let audit = self.manager.audit();

        if self.cancel.is_cancelled() {
            return self.defer(task, admission, "shutdown before staging").await;
        }

        let Some((mut task, staging)) = self.blocking(task, |m, t| m.stage(t)).await else {
            return self.lost(admission);
        };
        if let Err(e) = staging {
            error!("[{}] staging {} failed: {e:#}", task.id, task.name());
            self.notifier
                .notify(AlertCategory::StagingFailure, &task.name(), &format!("{e:#}"));
            return self
                .defer(task, admission, &format!("staging failed: {e:#}"))
                .await;
        }
        let Some(staged) = task.staged.clone() else {
            return self.defer(task, admission, "no staged copy").await;
        };

        if audit.transition(&mut task, FileState::Scanning, "").is_err() {
            return self.defer(task, admission, "illegal transition").await;
        }

        let size = task.size;
        let shared = Mutex::new(task);
        let scanned = self
            .orchestrator
            .scan_observed(
                &staged,
                size,
                &self.cancel,
                &RetryAudit {
                    task: &shared,
                    audit,
                },
            )
            .await;
        let mut task = shared.into_inner().unwrap_or_else(PoisonError::into_inner);

        let report = match scanned {
            Ok(report) => report,
            Err(ScanCancelled) => return self.defer(task, admission, "scan cancelled").await,
        };

        let to = match &report.verdict {
            ScanVerdict::Clean => FileState::Clean,
            ScanVerdict::Suspect(_) => FileState::Suspect,
            ScanVerdict::ScanFailed(_) | ScanVerdict::ScanTimedOut => FileState::ScanFailed,
        };
        let detail = match &report.verdict {
            ScanVerdict::Suspect(detail) | ScanVerdict::ScanFailed(detail) => detail.clone(),
            verdict => verdict.label().to_string(),
        };
        task.verdict = Some(report.verdict.clone());
        if audit.transition(&mut task, to, &detail).is_err() {
            self.throttler.finalize(admission, false);
            return TaskResult::Error;
        }

        let Some((_, routed)) = self.blocking(task, move |m, t| m.route(t, &report)).await else {
            return self.lost(admission);
        };
        match routed {
            Ok(outcome) => {
                self.throttler.finalize(admission, outcome.is_delivered());
                TaskResult::Finished(outcome)
            }
            Err(e) => {
                error!("{e}");
                self.throttler.finalize(admission, false);
                TaskResult::Error
            }
        }
    }

    async fn blocking<T, F>(&self, task: FileTask, work: F) -> Option<(FileTask, T)>
    where
        F: FnOnce(&QuarantineManager, &mut FileTask) -> T + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.manager), task, work).await
    }

    /// Return the task to a safe point and release its admission.
    async fn defer(&self, task: FileTask, admission: Admission, reason: &str) -> TaskResult {
        let (id, name) = (task.id, task.name());
        info!("[{id}] {name}: deferred ({reason})");
        if let Some((_, Err(e))) = self.blocking(task, |m, t| m.rollback(t)).await {
            error!("[{id}] rollback of {name} failed: {e:#}");
        }
        self.throttler.rollback(admission);
        TaskResult::Deferred
    }

    /// The task was lost with a panicked file operation. Its quota stays
    /// consumed.
    fn lost(&self, admission: Admission) -> TaskResult {
        self.throttler.finalize(admission, false);
        TaskResult::Error
    }
}

/// Run file work on `task` on the blocking pool, so copies, digests and
/// encryption never stall the runtime threads that drive scan timeouts.
///
/// Returns `None` if the work panicked.
async fn run_blocking<T, F>(
    manager: Arc<QuarantineManager>,
    mut task: FileTask,
    work: F,
) -> Option<(FileTask, T)>
where
    F: FnOnce(&QuarantineManager, &mut FileTask) -> T + Send + 'static,
    T: Send + 'static,
{
    let name = task.name();
    let joined = tokio::task::spawn_blocking(move || {
        let out = work(&manager, &mut task);
        (task, out)
    })
    .await;
    match joined {
        Ok(done) => Some(done),
        Err(e) => {
            error!("File operation on {name} failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{keypair, open_sealed};
    use crate::audit::read_entries;
    use crate::config::{ArchiveConfig, EngineConfig, NotifyConfig, ScanConfig};
    use crate::integrity::digest_file;
    use crate::ledger::ScannerVersionRecord;
    use crate::scanner::CombinePolicy;
    use crate::scanner::tests::sh_engine;
    use crate::status::PipelineStatus;
    use crate::throttle::ThrottleLimits;
    use crate::throttle::tests::{FixedSpace, ample};
    use crate::notify::Notifier;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    const EICAR: &[u8] =
        b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    /// Reports suspect (exit 3) for files containing the EICAR marker.
    const DETECT_EICAR: &str =
        "if grep -q EICAR-STANDARD \"$1\"; then echo 'Found: EICAR-Test'; exit 3; fi; exit 0";

    struct Fixture {
        dir: TempDir,
        config: PipelineConfig,
    }

    impl Fixture {
        fn new(script: &str, version: &str, tested: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path();
            fs::create_dir_all(root.join("in")).unwrap();

            let config = PipelineConfig {
                inbound: root.join("in"),
                staging: root.join("staging"),
                destination: root.join("out"),
                quarantine: root.join("quarantine"),
                state_dir: root.join("state"),
                archive: ArchiveConfig::default(),
                engines: vec![EngineConfig::Command(sh_engine("savscan", script, version))],
                combine_policy: CombinePolicy::AllClean,
                throttle: ThrottleLimits::default(),
                scan: ScanConfig {
                    retries: 2,
                    retry_wait_ms: 10,
                    timeout_base_ms: 10_000,
                    timeout_per_byte_ms: 0.0,
                },
                delete_source_on_success: true,
                delete_on_admit: false,
                workers: 2,
                ignore_file_patterns: vec![".part".to_string()],
                notify: NotifyConfig {
                    enable: false,
                    socket: None,
                    command: None,
                },
            };

            let mut ledger = VersionLedger::open_or_create(&config.ledger_path()).unwrap();
            ledger
                .record(ScannerVersionRecord {
                    engine: "savscan".to_string(),
                    version: tested.to_string(),
                    tested: true,
                    tested_at: Utc::now(),
                    result: "selftest passed".to_string(),
                })
                .unwrap();

            Self { dir, config }
        }

        fn inbound(&self, relative: &str, content: &[u8]) -> PathBuf {
            let path = self.config.inbound.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        async fn run(&self) -> Result<RunSummary, StartupError> {
            Coordinator::new(self.config.clone())
                .with_space_probe(ample())
                .run(&CancellationToken::new())
                .await
        }

        fn count(&self, dir: &Path) -> usize {
            fs::read_dir(dir).map(Iterator::count).unwrap_or(0)
        }

        fn audit_states(&self) -> Vec<String> {
            read_entries(&self.config.audit_path())
                .unwrap()
                .into_iter()
                .map(|e| e.to)
                .collect()
        }
    }

    #[tokio::test]
    async fn clean_file_is_delivered_and_verified() {
        let fx = Fixture::new("exit 0", "101.0", "101.0");
        let content: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let source = fx.inbound("reports/big.bin", &content);
        let expected = digest_file(&source).unwrap();

        let summary = fx.run().await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.delivered_bytes, 10 * 1024 * 1024);
        assert_eq!(summary.discovered, 1);
        let dest = fx.config.destination.join("reports/big.bin");
        assert_eq!(digest_file(&dest).unwrap(), expected);
        assert!(!source.exists());
        assert_eq!(fx.count(&fx.config.staging), 0);
        assert_eq!(
            fx.audit_states(),
            vec!["Admitted", "Staged", "Scanning", "Clean", "Delivered"]
        );
    }

    #[tokio::test]
    async fn suspect_file_is_archived_encrypted() {
        let mut fx = Fixture::new(DETECT_EICAR, "101.0", "101.0");
        let (secret, key) = keypair(fx.dir.path());
        fx.config.archive = ArchiveConfig {
            enable: true,
            path: Some(fx.dir.path().join("archive")),
            public_key: Some(key),
        };
        let source = fx.inbound("eicar.com", EICAR);
        fx.inbound("notes.txt", b"harmless");

        let summary = fx.run().await.unwrap();

        assert_eq!(summary.archived, 1);
        assert_eq!(summary.delivered, 1);
        assert!(!source.exists());
        assert_eq!(fx.count(&fx.config.quarantine), 0);
        assert_eq!(fx.count(&fx.config.staging), 0);
        assert!(!fx.config.destination.join("eicar.com").exists());

        let sealed: Vec<_> = fs::read_dir(fx.dir.path().join("archive"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "qga"))
            .collect();
        assert_eq!(sealed.len(), 1);
        assert_eq!(
            open_sealed(&secret, &fs::read(&sealed[0]).unwrap()),
            EICAR.to_vec()
        );
    }

    #[tokio::test]
    async fn version_mismatch_processes_nothing() {
        let fx = Fixture::new("exit 0", "101.1", "101.0");
        let source = fx.inbound("a.txt", b"hello");

        let err = fx.run().await.unwrap_err();

        assert_matches!(&err, StartupError::NotReady { reason } if reason.contains("101.1"));
        assert!(err.to_string().contains("savscan"));
        assert!(source.exists());
        assert_eq!(fx.count(&fx.config.staging), 0);
        assert!(!fx.config.audit_path().exists());

        let status = PipelineStatus::load(&fx.config.status_path()).unwrap();
        assert!(!status.ready);
        assert_eq!(
            status.engines["savscan"].detected_version.as_deref(),
            Some("101.1")
        );
    }

    #[tokio::test]
    async fn missing_ledger_is_fatal() {
        let fx = Fixture::new("exit 0", "1.0", "1.0");
        fs::remove_file(fx.config.ledger_path()).unwrap();
        fx.inbound("a.txt", b"hello");

        assert_matches!(
            fx.run().await,
            Err(StartupError::Ledger(LedgerError::Missing(_)))
        );
    }

    #[tokio::test]
    async fn missing_archive_key_is_fatal() {
        let mut fx = Fixture::new("exit 0", "1.0", "1.0");
        let key = fx.dir.path().join("archive.pub");
        fs::write(&key, "bm90IGEga2V5").unwrap();
        fx.config.archive = ArchiveConfig {
            enable: true,
            path: Some(fx.dir.path().join("archive")),
            public_key: Some(key),
        };
        let source = fx.inbound("a.txt", b"hello");

        assert_matches!(
            fx.run().await,
            Err(StartupError::ArchiveKey(ArchiveKeyError::Malformed { .. }))
        );
        assert!(source.exists());
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let mut fx = Fixture::new("exit 0", "2.0", "2.0");
        fx.config.delete_source_on_success = false;
        fx.inbound("a.txt", b"hello");
        fx.inbound("dir/b.txt", b"world");

        let first = fx.run().await.unwrap();
        assert_eq!(first.delivered, 2);

        let second = fx.run().await.unwrap();
        assert_eq!(second.delivered, 0);
        assert_eq!(second.skipped_delivered, 2);

        let daily: serde_json::Value =
            serde_json::from_slice(&fs::read(fx.config.throttle_path()).unwrap()).unwrap();
        assert_eq!(daily["files"], 2);
        assert_eq!(daily["bytes"], 10);
    }

    #[tokio::test]
    async fn exhausted_retries_end_reported_failed() {
        let fx = Fixture::new("echo 'engine crashed' >&2; exit 2", "1.0", "1.0");
        let source = fx.inbound("odd.bin", b"???");

        let summary = fx.run().await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 0);
        assert!(!fx.config.destination.join("odd.bin").exists());
        assert!(!source.exists());
        assert_eq!(fx.count(&fx.config.quarantine), 2);

        let states = fx.audit_states();
        assert_eq!(states.iter().filter(|s| *s == "Retrying").count(), 2);
        assert_eq!(states.last().map(String::as_str), Some("ReportedFailed"));
    }

    #[tokio::test]
    async fn disk_space_rejection_leaves_files_in_place() {
        let fx = Fixture::new("exit 0", "1.0", "1.0");
        let a = fx.inbound("a.txt", b"hello");
        let b = fx.inbound("b.txt", b"world");

        let summary = Coordinator::new(fx.config.clone())
            .with_space_probe(Box::new(FixedSpace(Arc::new(AtomicU64::new(3)))))
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.rejected_disk_space, 2);
        assert_eq!(summary.delivered, 0);
        assert!(a.exists() && b.exists());
        assert_eq!(fx.count(&fx.config.staging), 0);
    }

    #[tokio::test]
    async fn disk_space_alert_is_sent_once_per_run() {
        let mut fx = Fixture::new("exit 0", "1.0", "1.0");
        let socket = fx.dir.path().join("notify.sock");
        fx.config.notify = NotifyConfig {
            enable: true,
            socket: Some(socket.clone()),
            command: None,
        };
        let listener = UnixListener::bind(&socket).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut line = String::new();
                if stream.read_to_string(&mut line).await.is_ok() {
                    sink.lock().unwrap().push(line);
                }
            }
        });
        fx.inbound("a.txt", b"hello");
        fx.inbound("b.txt", b"world");
        fx.inbound("c.txt", b"again");

        let summary = Coordinator::new(fx.config.clone())
            .with_space_probe(Box::new(FixedSpace(Arc::new(AtomicU64::new(3)))))
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.rejected_disk_space, 3);

        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = received.lock().unwrap().clone();
        assert_eq!(lines.len(), 1);
        let staging = fx.config.staging.display().to_string();
        assert!(lines[0].starts_with(&format!("disk-space: {staging}: ")));
    }

    #[tokio::test]
    async fn file_work_runs_on_the_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(QuarantineManager::new(
            Areas {
                staging: dir.path().join("staging"),
                destination: dir.path().join("out"),
                quarantine: dir.path().join("quarantine"),
            },
            None,
            true,
            false,
            Arc::new(AuditTrail::open(&dir.path().join("audit.jsonl")).unwrap()),
            Notifier::disabled(),
        ));
        let task = FileTask::new(dir.path().join("a.txt"), PathBuf::from("a.txt"), 0);
        let caller = std::thread::current().id();

        let (task, ran_on) = run_blocking(Arc::clone(&manager), task, |_, _| {
            std::thread::current().id()
        })
        .await
        .unwrap();
        assert_ne!(ran_on, caller);
        assert_eq!(task.relative, PathBuf::from("a.txt"));

        let lost = run_blocking(manager, task, |_, _| -> u8 { panic!("copy failed") }).await;
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn quota_rejections_are_counted_separately() {
        let mut fx = Fixture::new("exit 0", "1.0", "1.0");
        fx.config.throttle.daily_max_bytes = 1000;
        fx.inbound("a.bin", &[1u8; 600]);
        let b = fx.inbound("b.bin", &[2u8; 600]);

        let summary = fx.run().await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.rejected_daily_quota, 1);
        assert_eq!(summary.rejected_disk_space, 0);
        assert!(b.exists());
    }

    #[tokio::test]
    async fn ignored_and_symlinked_files_are_skipped() {
        let fx = Fixture::new("exit 0", "1.0", "1.0");
        fx.inbound("download.part", b"partial");
        let outside = fx.dir.path().join("outside.txt");
        fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, fx.config.inbound.join("link.txt")).unwrap();

        let summary = fx.run().await.unwrap();

        assert_eq!(summary.skipped_ignored, 1);
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.delivered, 0);
        assert!(!fx.config.destination.join("link.txt").exists());
    }

    #[tokio::test]
    async fn shutdown_rolls_back_in_flight_files() {
        let fx = Fixture::new("sleep 30", "1.0", "1.0");
        let source = fx.inbound("slow.bin", b"data");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let summary = Coordinator::new(fx.config.clone())
            .with_space_probe(ample())
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(summary.deferred, 1);
        assert!(source.exists());
        assert_eq!(fx.count(&fx.config.staging), 0);
        assert_eq!(fx.audit_states().last().map(String::as_str), Some("Admitted"));

        let daily: serde_json::Value =
            serde_json::from_slice(&fs::read(fx.config.throttle_path()).unwrap()).unwrap();
        assert_eq!(daily["files"], 0);
    }

    #[test]
    fn enumerate_is_sorted_and_recursive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/c")).unwrap();
        fs::write(dir.path().join("b/c/z.txt"), b"1").unwrap();
        fs::write(dir.path().join("a.txt"), b"22").unwrap();

        let found = enumerate(dir.path()).unwrap();
        let relative: Vec<_> = found.iter().map(|c| c.relative.clone()).collect();
        assert_eq!(
            relative,
            vec![PathBuf::from("a.txt"), PathBuf::from("b/c/z.txt")]
        );
        assert_eq!(found[0].size, 2);
    }
}
