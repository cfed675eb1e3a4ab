// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Staging, delivery, quarantine and archival of files.
//!
//! Every move is a rename when source and target share a filesystem. The
//! source file is only removed after the copy that replaces it has been
//! verified against the digest computed at staging.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rustix::fs::{CWD, Mode, OFlags, RenameFlags};
use rustix::io::Errno;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::archive::HazardArchive;
use crate::audit::AuditTrail;
use crate::integrity::{Digest, IntegrityError, copy_with_digest, digest_file, verify_file};
use crate::notify::{AlertCategory, Notifier};
use crate::scanner::{EngineReport, ScanReport, ScanVerdict};
use crate::task::{FileState, FileTask, TransitionError};
use crate::util::unique_holding_path;

/// Mode for files held in quarantine: owner read-only.
const QUARANTINE_MODE: u32 = 0o400;

// =============================================================================
// Filesystem Helpers
// =============================================================================

/// Attempts at finding a free holding name before giving up.
const HOLDING_ATTEMPTS: usize = 8;

/// Move `src` to `dst`, overwriting `dst`.
///
/// Uses rename; across filesystems falls back to a synced temp copy in the
/// target directory, persisted before the source is removed.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    relocate(src, dst, true)
        .with_context(|| format!("Failed to move {} -> {}", src.display(), dst.display()))
}

/// Move `src` to `dst` unless `dst` exists, which fails with `AlreadyExists`.
pub fn move_file_noclobber(src: &Path, dst: &Path) -> io::Result<()> {
    relocate(src, dst, false)
}

fn relocate(src: &Path, dst: &Path, replace: bool) -> io::Result<()> {
    let parent = dst
        .parent()
        .ok_or_else(|| io::Error::other("destination has no parent"))?;
    fs::create_dir_all(parent)?;

    let renamed = if replace {
        fs::rename(src, dst)
    } else {
        rename_noreplace(src, dst)
    };
    match renamed {
        Err(e) if e.raw_os_error() == Some(Errno::XDEV.raw_os_error()) => {
            debug!(
                "Cross-device move {} -> {}, copying",
                src.display(),
                dst.display()
            );
            let mut input = File::open(src)?;
            let mut tmp = NamedTempFile::new_in(parent)?;
            io::copy(&mut input, &mut tmp)?;
            tmp.as_file().sync_all()?;
            let persisted = if replace {
                tmp.persist(dst)
            } else {
                tmp.persist_noclobber(dst)
            };
            persisted.map_err(|e| e.error)?;
            fs::remove_file(src)
        }
        other => other,
    }
}

fn rename_noreplace(src: &Path, dst: &Path) -> io::Result<()> {
    match rustix::fs::renameat_with(CWD, src, CWD, dst, RenameFlags::NOREPLACE) {
        Ok(()) => Ok(()),
        // Filesystem without RENAME_NOREPLACE.
        Err(e) if e == Errno::INVAL => {
            fs::hard_link(src, dst)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e.into()),
    }
}

/// Persist `tmp` in `dir` under a fresh holding name for `relative`.
/// An existing file is never replaced.
fn persist_holding(mut tmp: NamedTempFile, dir: &Path, relative: &Path) -> Result<PathBuf> {
    for _ in 0..HOLDING_ATTEMPTS {
        let path = unique_holding_path(dir, relative);
        match tmp.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => tmp = e.file,
            Err(e) => {
                return Err(e.error)
                    .with_context(|| format!("failed to persist to {}", path.display()));
            }
        }
    }
    anyhow::bail!("no free holding name in {}", dir.display())
}

/// Move `src` into `dir` under a fresh holding name for `relative`.
/// An existing file is never replaced.
fn move_to_holding(src: &Path, dir: &Path, relative: &Path) -> Result<PathBuf> {
    for _ in 0..HOLDING_ATTEMPTS {
        let path = unique_holding_path(dir, relative);
        match move_file_noclobber(src, &path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to move {} -> {}", src.display(), path.display())
                });
            }
        }
    }
    anyhow::bail!("no free holding name in {}", dir.display())
}

/// Open a regular file without following symlinks.
fn safe_open(path: &Path) -> Result<File> {
    let fd = rustix::fs::open(
        path,
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| anyhow::anyhow!("open failed for {}: {e}", path.display()))?;
    let file = File::from(fd);

    if !file.metadata()?.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    Ok(file)
}

/// Sidecar written next to every quarantined file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineRecord {
    pub original_path: PathBuf,
    /// `detection`, `scan-failed` or `integrity-mismatch`.
    pub reason: String,
    pub detail: String,
    pub engines: Vec<EngineReport>,
    pub digest: Option<Digest>,
    pub size: u64,
    pub quarantined_at: DateTime<Utc>,
}

/// Remove a staged copy that will not be used.
fn discard(staged: &Path) {
    if let Err(e) = fs::remove_file(staged) {
        warn!("Failed to remove {}: {e}", staged.display());
    }
}

fn sidecar_path(held: &Path) -> PathBuf {
    let mut name = held.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    held.with_file_name(name)
}

// =============================================================================
// Manager
// =============================================================================

/// Terminal outcome of a routed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// `delivered` is false when the delivered copy failed verification.
    DeleteFailed { delivered: bool },
    /// Held in quarantine; archiving disabled or failed.
    Quarantined,
    Archived,
    ReportedFailed,
}

impl Outcome {
    /// Whether the file reached the destination.
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered | Self::DeleteFailed { delivered: true })
    }
}

#[derive(Debug, Clone)]
pub struct Areas {
    pub staging: PathBuf,
    pub destination: PathBuf,
    pub quarantine: PathBuf,
}

pub struct QuarantineManager {
    areas: Areas,
    archive: Option<HazardArchive>,
    delete_source_on_success: bool,
    delete_on_admit: bool,
    audit: Arc<AuditTrail>,
    notifier: Notifier,
}

impl QuarantineManager {
    #[must_use]
    pub const fn new(
        areas: Areas,
        archive: Option<HazardArchive>,
        delete_source_on_success: bool,
        delete_on_admit: bool,
        audit: Arc<AuditTrail>,
        notifier: Notifier,
    ) -> Self {
        Self {
            areas,
            archive,
            delete_source_on_success,
            delete_on_admit,
            audit,
            notifier,
        }
    }

    #[must_use]
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Destination already holds identical content for `relative`.
    #[must_use]
    pub fn is_already_delivered(&self, source: &Path, relative: &Path, size: u64) -> bool {
        let dest = self.areas.destination.join(relative);
        match fs::symlink_metadata(&dest) {
            Ok(m) if m.is_file() && m.len() == size => {}
            _ => return false,
        }
        match (digest_file(source), digest_file(&dest)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Copy the source into the staging area and verify the staged copy.
    ///
    /// On error the task stays `Admitted` and nothing is left in staging.
    pub fn stage(&self, task: &mut FileTask) -> Result<()> {
        fs::create_dir_all(&self.areas.staging)?;

        let source = safe_open(&task.source)?;
        let mut tmp = NamedTempFile::new_in(&self.areas.staging)
            .context("failed to create staging file")?;
        let (digest, copied) = copy_with_digest(&source, &mut tmp)
            .with_context(|| format!("Failed to stage {}", task.source.display()))?;
        tmp.as_file().sync_all()?;
        let staged = persist_holding(tmp, &self.areas.staging, &task.relative)?;

        if let Err(e) = verify_file(&staged, &digest) {
            discard(&staged);
            return Err(e.into());
        }

        if self.delete_on_admit {
            if let Err(e) = verify_file(&task.source, &digest) {
                discard(&staged);
                return Err(anyhow::Error::new(e).context("source changed while staging"));
            }
            if let Err(e) = fs::remove_file(&task.source) {
                discard(&staged);
                return Err(e)
                    .with_context(|| format!("Failed to remove {}", task.source.display()));
            }
        }

        task.size = copied;
        task.staged = Some(staged);
        task.digest = Some(digest.clone());

        let detail = if self.delete_on_admit {
            format!("{copied} bytes, sha256 {digest}, source removed")
        } else {
            format!("{copied} bytes, sha256 {digest}")
        };
        self.advance(task, FileState::Staged, &detail)?;
        Ok(())
    }

    /// Return an unfinished task to a safe point: staged copy removed, or
    /// put back at the source when the source was already removed.
    pub fn rollback(&self, task: &mut FileTask) -> Result<()> {
        if let Some(staged) = task.staged.take() {
            if self.delete_on_admit && !task.source.exists() {
                move_file_noclobber(&staged, &task.source).with_context(|| {
                    format!("Failed to restore {} from staging", task.source.display())
                })?;
                info!("Restored {} from staging", task.source.display());
            } else if let Err(e) = fs::remove_file(&staged) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", staged.display()));
                }
            }
        }

        if matches!(task.state(), FileState::Scanning | FileState::Retrying) {
            self.advance(task, FileState::Staged, "shutdown")?;
        }
        if task.state() == FileState::Staged {
            self.advance(task, FileState::Admitted, "rolled back")?;
        }
        Ok(())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Route a scanned task to its terminal location according to its state.
    pub fn route(
        &self,
        task: &mut FileTask,
        report: &ScanReport,
    ) -> Result<Outcome, TransitionError> {
        match task.state() {
            FileState::Clean => self.deliver(task, report),
            FileState::Suspect => self.quarantine(task, report),
            _ => self.report_failed(task, report),
        }
    }

    fn deliver(
        &self,
        task: &mut FileTask,
        report: &ScanReport,
    ) -> Result<Outcome, TransitionError> {
        let (Some(staged), Some(digest)) = (task.staged.clone(), task.digest.clone()) else {
            return self.delete_failed(task, false, "no staged copy");
        };
        let dest = self.areas.destination.join(&task.relative);

        if let Err(e) = move_file(&staged, &dest) {
            error!("Delivery of {} failed: {e:#}", task.name());
            self.notifier
                .notify(AlertCategory::IntegrityFailure, &task.name(), &format!("{e:#}"));
            if let Err(e) = self.hold(task, &staged, "delivery-failed", &format!("{e:#}"), report) {
                error!("Failed to hold {}: {e:#}", task.name());
            }
            return self.delete_failed(task, false, "delivery failed, source kept");
        }
        task.staged = None;

        match verify_file(&dest, &digest) {
            Ok(()) => {}
            Err(e) => {
                error!("Delivered copy of {} failed verification: {e}", task.name());
                self.notifier
                    .notify(AlertCategory::IntegrityFailure, &task.name(), &e.to_string());
                let detail = e.to_string();
                if let Err(e) = self.hold(task, &dest, "integrity-mismatch", &detail, report) {
                    error!("Failed to hold {}: {e:#}", task.name());
                }
                return self.delete_failed(task, false, "integrity mismatch, source kept");
            }
        }

        if self.delete_source_on_success && task.source.exists() {
            match verify_file(&task.source, &digest) {
                Ok(()) => {}
                Err(IntegrityError::Mismatch { .. }) => {
                    warn!("{} changed since staging, keeping source", task.name());
                    return self.finish(task, FileState::Delivered, "source changed, kept");
                }
                Err(e) => return self.delete_failed(task, true, &e.to_string()),
            }
            if let Err(e) = fs::remove_file(&task.source) {
                return self.delete_failed(task, true, &format!("source removal failed: {e}"));
            }
            return self.finish(task, FileState::Delivered, "source removed");
        }

        self.finish(task, FileState::Delivered, &dest.display().to_string())
    }

    fn quarantine(
        &self,
        task: &mut FileTask,
        report: &ScanReport,
    ) -> Result<Outcome, TransitionError> {
        let detection = match &report.verdict {
            ScanVerdict::Suspect(sig) => sig.clone(),
            other => other.label().to_string(),
        };
        self.notifier
            .notify(AlertCategory::Detection, &task.name(), &detection);

        let held = match task.staged.clone() {
            Some(staged) => match self.hold(task, &staged, "detection", &detection, report) {
                Ok(held) => held,
                Err(e) => {
                    // Staged copy stays in staging; the source is untouched.
                    error!("Failed to quarantine {}: {e:#}", task.name());
                    let detail = format!("hold failed: {e:#}");
                    return self.finish(task, FileState::Quarantined, &detail);
                }
            },
            None => return self.finish(task, FileState::Quarantined, "no staged copy"),
        };
        task.staged = None;
        self.remove_source_verified(task);
        self.advance(task, FileState::Quarantined, &held.display().to_string())?;

        let Some(archive) = &self.archive else {
            return Ok(Outcome::Quarantined);
        };
        match self.archive_held(archive, &held) {
            Ok(sealed) => {
                self.advance(task, FileState::Archived, &sealed.display().to_string())?;
                Ok(Outcome::Archived)
            }
            Err(e) => {
                error!("Archiving {} failed: {e:#}", task.name());
                self.notifier
                    .notify(AlertCategory::ArchiveFailure, &task.name(), &format!("{e:#}"));
                Ok(Outcome::Quarantined)
            }
        }
    }

    fn report_failed(
        &self,
        task: &mut FileTask,
        report: &ScanReport,
    ) -> Result<Outcome, TransitionError> {
        let reason = match &report.verdict {
            ScanVerdict::ScanFailed(reason) => reason.clone(),
            other => other.label().to_string(),
        };
        self.notifier
            .notify(AlertCategory::ScanFailure, &task.name(), &reason);

        if task.state() == FileState::Scanning {
            self.advance(task, FileState::ScanFailed, &reason)?;
        }

        let detail = match task.staged.clone() {
            Some(staged) => match self.hold(task, &staged, "scan-failed", &reason, report) {
                Ok(held) => {
                    task.staged = None;
                    self.remove_source_verified(task);
                    format!("held at {}", held.display())
                }
                Err(e) => {
                    error!("Failed to hold {}: {e:#}", task.name());
                    format!("left in staging: {e:#}")
                }
            },
            None => reason,
        };
        self.finish(task, FileState::ReportedFailed, &detail)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Move `file` into quarantine with a metadata sidecar.
    fn hold(
        &self,
        task: &FileTask,
        file: &Path,
        reason: &str,
        detail: &str,
        report: &ScanReport,
    ) -> Result<PathBuf> {
        let held = move_to_holding(file, &self.areas.quarantine, &task.relative)?;
        fs::set_permissions(&held, fs::Permissions::from_mode(QUARANTINE_MODE))?;

        if let Some(digest) = &task.digest {
            if let Err(e) = verify_file(&held, digest) {
                warn!("Quarantined copy of {}: {e}", task.name());
            }
        }

        let record = QuarantineRecord {
            original_path: task.source.clone(),
            reason: reason.to_string(),
            detail: detail.to_string(),
            engines: report.engines.clone(),
            digest: task.digest.clone(),
            size: task.size,
            quarantined_at: Utc::now(),
        };
        let sidecar = sidecar_path(&held);
        crate::util::write_json_atomic(&sidecar, &record)?;

        info!("Quarantined {} -> {}", task.name(), held.display());
        Ok(held)
    }

    /// Seal a quarantined file, move its sidecar along, delete the plaintext.
    fn archive_held(&self, archive: &HazardArchive, held: &Path) -> Result<PathBuf> {
        let name = held
            .file_name()
            .context("quarantined path has no file name")?
            .to_string_lossy()
            .into_owned();
        let sealed = archive.seal(held, &name)?;

        let sidecar = sidecar_path(held);
        if sidecar.exists() {
            archive.store_metadata(&sidecar)?;
        }
        fs::remove_file(held)
            .with_context(|| format!("Failed to remove plaintext {}", held.display()))?;
        Ok(sealed)
    }

    /// Remove the source once its content is held elsewhere. A source that
    /// changed since staging is kept.
    fn remove_source_verified(&self, task: &FileTask) {
        let Some(digest) = &task.digest else {
            return;
        };
        if !task.source.exists() {
            return;
        }
        match verify_file(&task.source, digest) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&task.source) {
                    warn!("Failed to remove source {}: {e}", task.source.display());
                }
            }
            Err(e) => warn!("Keeping source {}: {e}", task.source.display()),
        }
    }

    fn delete_failed(
        &self,
        task: &mut FileTask,
        delivered: bool,
        detail: &str,
    ) -> Result<Outcome, TransitionError> {
        self.finish(task, FileState::DeleteFailed, detail)?;
        Ok(Outcome::DeleteFailed { delivered })
    }

    fn finish(
        &self,
        task: &mut FileTask,
        to: FileState,
        detail: &str,
    ) -> Result<Outcome, TransitionError> {
        self.advance(task, to, detail)?;
        Ok(match to {
            FileState::DeleteFailed => Outcome::DeleteFailed { delivered: true },
            FileState::Quarantined => Outcome::Quarantined,
            FileState::Archived => Outcome::Archived,
            FileState::ReportedFailed => Outcome::ReportedFailed,
            _ => Outcome::Delivered,
        })
    }

    fn advance(
        &self,
        task: &mut FileTask,
        to: FileState,
        detail: &str,
    ) -> Result<(), TransitionError> {
        self.audit.transition(task, to, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchivePublicKey;
    use crate::archive::tests::{keypair, open_sealed};
    use crate::audit::read_entries;
    use crate::integrity::digest_reader;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        manager: QuarantineManager,
    }

    impl Fixture {
        fn new(
            archive: bool,
            delete_source: bool,
            delete_on_admit: bool,
        ) -> (Self, Option<x25519_dalek::StaticSecret>) {
            let dir = TempDir::new().unwrap();
            let areas = Areas {
                staging: dir.path().join("staging"),
                destination: dir.path().join("out"),
                quarantine: dir.path().join("quarantine"),
            };
            fs::create_dir_all(dir.path().join("in")).unwrap();
            let (archive, secret) = if archive {
                let (secret, key) = keypair(dir.path());
                (
                    Some(HazardArchive::new(
                        dir.path().join("archive"),
                        ArchivePublicKey::load(&key).unwrap(),
                    )),
                    Some(secret),
                )
            } else {
                (None, None)
            };
            let audit = Arc::new(AuditTrail::open(&dir.path().join("audit.jsonl")).unwrap());
            let manager = QuarantineManager::new(
                areas,
                archive,
                delete_source,
                delete_on_admit,
                audit,
                Notifier::disabled(),
            );
            (Self { dir, manager }, secret)
        }

        fn task(&self, relative: &str, content: &[u8]) -> FileTask {
            let source = self.dir.path().join("in").join(relative);
            fs::create_dir_all(source.parent().unwrap()).unwrap();
            fs::write(&source, content).unwrap();
            let mut task = FileTask::new(source, PathBuf::from(relative), content.len() as u64);
            task.advance(FileState::Admitted).unwrap();
            task
        }

        fn scanned(&self, task: &mut FileTask, verdict: &ScanVerdict) -> ScanReport {
            self.manager.stage(task).unwrap();
            task.advance(FileState::Scanning).unwrap();
            let to = match verdict {
                ScanVerdict::Clean => FileState::Clean,
                ScanVerdict::Suspect(_) => FileState::Suspect,
                _ => FileState::ScanFailed,
            };
            task.advance(to).unwrap();
            ScanReport {
                verdict: verdict.clone(),
                engines: vec![EngineReport {
                    engine: "test".to_string(),
                    verdict: verdict.clone(),
                    attempts: 1,
                }],
            }
        }

        fn quarantine_files(&self) -> Vec<String> {
            let mut names: Vec<_> = fs::read_dir(self.dir.path().join("quarantine"))
                .map(|rd| {
                    rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        }
    }

    #[test]
    fn stage_copies_and_records_digest() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut task = fx.task("docs/a.txt", b"hello");

        fx.manager.stage(&mut task).unwrap();

        assert_eq!(task.state(), FileState::Staged);
        let staged = task.staged.clone().unwrap();
        assert!(staged.starts_with(fx.dir.path().join("staging")));
        assert_eq!(fs::read(&staged).unwrap(), b"hello");
        assert_eq!(
            task.digest.clone().unwrap(),
            digest_reader(&b"hello"[..]).unwrap()
        );
        assert!(task.source.exists());
    }

    #[test]
    fn stage_with_delete_on_admit_removes_source() {
        let (fx, _) = Fixture::new(false, true, true);
        let mut task = fx.task("a.txt", b"hello");
        fx.manager.stage(&mut task).unwrap();
        assert!(!task.source.exists());
    }

    #[test]
    fn stage_rejects_symlink() {
        let (fx, _) = Fixture::new(false, true, false);
        let target = fx.dir.path().join("secret");
        fs::write(&target, b"x").unwrap();
        let link = fx.dir.path().join("in/link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut task = FileTask::new(link, PathBuf::from("link"), 1);
        task.advance(FileState::Admitted).unwrap();
        assert!(fx.manager.stage(&mut task).is_err());
        assert_eq!(task.state(), FileState::Admitted);
        assert_eq!(fs::read_dir(fx.dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn clean_file_is_delivered_and_source_removed() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut task = fx.task("docs/a.txt", b"hello");
        let report = fx.scanned(&mut task, &ScanVerdict::Clean);

        let outcome = fx.manager.route(&mut task, &report).unwrap();

        assert_eq!(outcome, Outcome::Delivered);
        let dest = fx.dir.path().join("out/docs/a.txt");
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert!(!task.source.exists());
        assert_eq!(
            fs::read_dir(fx.dir.path().join("staging")).unwrap().count(),
            0
        );
        assert!(fx.manager.is_already_delivered(&dest, Path::new("docs/a.txt"), 5));
    }

    #[test]
    fn clean_file_keeps_source_without_delete_flag() {
        let (fx, _) = Fixture::new(false, false, false);
        let mut task = fx.task("a.txt", b"hello");
        let report = fx.scanned(&mut task, &ScanVerdict::Clean);

        assert_eq!(fx.manager.route(&mut task, &report).unwrap(), Outcome::Delivered);
        assert!(task.source.exists());
        assert!(fx
            .manager
            .is_already_delivered(&task.source, Path::new("a.txt"), 5));
    }

    #[test]
    fn corrupted_delivery_keeps_source() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut task = fx.task("a.txt", b"hello");
        let report = fx.scanned(&mut task, &ScanVerdict::Clean);
        fs::write(task.staged.as_ref().unwrap(), b"tampered").unwrap();

        let outcome = fx.manager.route(&mut task, &report).unwrap();

        assert_eq!(outcome, Outcome::DeleteFailed { delivered: false });
        assert_eq!(task.state(), FileState::DeleteFailed);
        assert!(task.source.exists());
        assert!(!fx.dir.path().join("out/a.txt").exists());
        assert_eq!(fx.quarantine_files().len(), 2);
    }

    #[test]
    fn suspect_file_is_quarantined_with_metadata() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut task = fx.task("sub/eicar.com", b"malware");
        let report = fx.scanned(&mut task, &ScanVerdict::Suspect("Eicar".to_string()));

        let outcome = fx.manager.route(&mut task, &report).unwrap();

        assert_eq!(outcome, Outcome::Quarantined);
        assert!(!task.source.exists());
        let files = fx.quarantine_files();
        assert_eq!(files.len(), 2);
        assert!(files[0].starts_with("eicar_") && files[0].ends_with(".com"));
        assert_eq!(files[1], format!("{}.meta.json", files[0]));

        let meta: serde_json::Value = serde_json::from_slice(
            &fs::read(fx.dir.path().join("quarantine").join(&files[1])).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["reason"], "detection");
        assert_eq!(meta["detail"], "Eicar");
        assert_eq!(meta["size"], 7);
    }

    #[test]
    fn suspect_file_is_archived_encrypted() {
        let (fx, secret) = Fixture::new(true, true, false);
        let mut task = fx.task("eicar.com", b"malware");
        let report = fx.scanned(&mut task, &ScanVerdict::Suspect("Eicar".to_string()));

        let outcome = fx.manager.route(&mut task, &report).unwrap();

        assert_eq!(outcome, Outcome::Archived);
        assert_eq!(task.state(), FileState::Archived);
        assert!(!task.source.exists());
        assert!(fx.quarantine_files().is_empty());

        let mut archived: Vec<_> = fs::read_dir(fx.dir.path().join("archive"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        archived.sort();
        assert_eq!(archived.len(), 2);
        let sealed = archived
            .iter()
            .find(|p| p.extension().is_some_and(|e| e == "qga"))
            .unwrap();
        assert_eq!(
            open_sealed(&secret.unwrap(), &fs::read(sealed).unwrap()),
            b"malware".to_vec()
        );
    }

    #[test]
    fn archive_failure_leaves_file_quarantined() {
        let (fx, _) = Fixture::new(true, true, false);
        // A file where the archive directory should be.
        fs::write(fx.dir.path().join("archive"), b"").unwrap();
        let mut task = fx.task("eicar.com", b"malware");
        let report = fx.scanned(&mut task, &ScanVerdict::Suspect("Eicar".to_string()));

        assert_eq!(
            fx.manager.route(&mut task, &report).unwrap(),
            Outcome::Quarantined
        );
        assert_eq!(fx.quarantine_files().len(), 2);
    }

    #[test]
    fn scan_failure_is_held_for_review() {
        let (fx, _) = Fixture::new(true, true, false);
        let mut task = fx.task("odd.bin", b"???");
        let report = fx.scanned(&mut task, &ScanVerdict::ScanFailed("engine crashed".to_string()));

        let outcome = fx.manager.route(&mut task, &report).unwrap();

        assert_eq!(outcome, Outcome::ReportedFailed);
        assert!(!outcome.is_delivered());
        assert!(!fx.dir.path().join("out/odd.bin").exists());
        assert_eq!(fx.quarantine_files().len(), 2);
        assert!(!fx.dir.path().join("archive").exists());
    }

    #[test]
    fn rollback_removes_staged_copy() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut task = fx.task("a.txt", b"hello");
        fx.manager.stage(&mut task).unwrap();
        task.advance(FileState::Scanning).unwrap();
        let staged = task.staged.clone().unwrap();

        fx.manager.rollback(&mut task).unwrap();

        assert_eq!(task.state(), FileState::Admitted);
        assert!(!staged.exists());
        assert!(task.source.exists());
    }

    #[test]
    fn rollback_restores_source_after_delete_on_admit() {
        let (fx, _) = Fixture::new(false, true, true);
        let mut task = fx.task("a.txt", b"hello");
        fx.manager.stage(&mut task).unwrap();
        assert!(!task.source.exists());

        fx.manager.rollback(&mut task).unwrap();

        assert_eq!(fs::read(&task.source).unwrap(), b"hello");
        assert_matches!(task.staged, None);
    }

    #[test]
    fn transitions_reach_audit_trail() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut task = fx.task("a.txt", b"hello");
        let report = fx.scanned(&mut task, &ScanVerdict::Clean);
        fx.manager.route(&mut task, &report).unwrap();

        let to: Vec<_> = read_entries(fx.manager.audit().path())
            .unwrap()
            .into_iter()
            .map(|e| e.to)
            .collect();
        assert_eq!(to, vec!["Staged", "Delivered"]);
    }

    #[test]
    fn same_filename_from_two_directories_stages_separately() {
        let (fx, _) = Fixture::new(false, true, false);
        let mut a = fx.task("a/x.txt", b"first");
        let mut b = fx.task("b/x.txt", b"second");

        fx.manager.stage(&mut a).unwrap();
        fx.manager.stage(&mut b).unwrap();

        assert_ne!(a.staged, b.staged);
        assert_eq!(fs::read(a.staged.as_ref().unwrap()).unwrap(), b"first");
        assert_eq!(fs::read(b.staged.as_ref().unwrap()).unwrap(), b"second");
    }

    #[test]
    fn suspects_with_the_same_name_are_all_held() {
        let (fx, _) = Fixture::new(false, true, false);
        let suspect = ScanVerdict::Suspect("Eicar".to_string());
        let mut a = fx.task("a/eicar.com", b"first");
        let mut b = fx.task("b/eicar.com", b"second");
        let report_a = fx.scanned(&mut a, &suspect);
        let report_b = fx.scanned(&mut b, &suspect);

        fx.manager.route(&mut a, &report_a).unwrap();
        fx.manager.route(&mut b, &report_b).unwrap();

        let held: Vec<Vec<u8>> = fx
            .quarantine_files()
            .iter()
            .filter(|n| !n.ends_with(".meta.json"))
            .map(|n| fs::read(fx.dir.path().join("quarantine").join(n)).unwrap())
            .collect();
        assert_eq!(held.len(), 2);
        assert!(held.contains(&b"first".to_vec()) && held.contains(&b"second".to_vec()));
    }

    #[test]
    fn source_removal_failure_leaves_nothing_staged() {
        let (fx, _) = Fixture::new(false, true, true);
        let mut task = fx.task("locked/a.txt", b"hello");
        let locked = task.source.parent().unwrap().to_path_buf();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        // Privileged users may remove entries regardless of directory mode.
        if fs::write(locked.join("writable"), b"").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = fx.manager.stage(&mut task);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(result.is_err());
        assert_eq!(task.state(), FileState::Admitted);
        assert_matches!(task.staged, None);
        assert!(task.source.exists());
        assert_eq!(fs::read_dir(fx.dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn move_file_noclobber_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"new").unwrap();
        fs::write(&b, b"old").unwrap();

        let err = move_file_noclobber(&a, &b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&a).unwrap(), b"new");
        assert_eq!(fs::read(&b).unwrap(), b"old");

        let c = dir.path().join("nested/c");
        move_file_noclobber(&a, &c).unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read(&c).unwrap(), b"new");
    }

    #[test]
    fn move_file_overwrites() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("nested/b");
        fs::write(&a, b"new").unwrap();
        fs::create_dir_all(b.parent().unwrap()).unwrap();
        fs::write(&b, b"old").unwrap();

        move_file(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read(&b).unwrap(), b"new");
    }
}
