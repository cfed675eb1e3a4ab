// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Scanner engine adapters and the scan orchestrator.
//!
//! Engines are external programs invoked once per file against the staged
//! copy. Each engine is wrapped in a [`ScanEngine`] adapter that builds the
//! command line and maps exit status and output onto a [`ScanVerdict`]:
//! - `Clean`: the engine reported no detection
//! - `Suspect`: the engine reported a detection (with signature name)
//! - `ScanFailed`: the engine errored, crashed or produced unparseable output
//! - `ScanTimedOut`: the engine did not finish within the computed timeout
//!
//! The adapter is the only engine-coupled code. A change in an engine's
//! output format could make it misparse a detection as clean, which is why
//! the pipeline refuses to start on an engine version missing from the ledger.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Placeholder in engine arguments replaced by the scanned file path.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Default timeout for version detection commands.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Types
// =============================================================================

/// Result of a single scan attempt (or the combined result of several).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "camelCase")]
pub enum ScanVerdict {
    Clean,
    /// Detection with signature name.
    Suspect(String),
    /// Engine error, crash or unparseable output.
    ScanFailed(String),
    ScanTimedOut,
}

impl ScanVerdict {
    /// Whether another attempt may resolve this verdict.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ScanFailed(_) | Self::ScanTimedOut)
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Suspect(_) => "suspect",
            Self::ScanFailed(_) => "scan-failed",
            Self::ScanTimedOut => "scan-timed-out",
        }
    }
}

/// Captured output of an engine process.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Exit code, `None` if the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for EngineOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl EngineOutput {
    fn first_line(text: &str) -> Option<&str> {
        text.lines().map(str::trim).find(|l| !l.is_empty())
    }

    fn failure_reason(&self) -> String {
        let detail = Self::first_line(&self.stderr)
            .or_else(|| Self::first_line(&self.stdout))
            .unwrap_or("no output");
        match self.status {
            Some(code) => format!("exit status {code}: {detail}"),
            None => format!("terminated by signal: {detail}"),
        }
    }
}

/// Scanner engine adapter.
///
/// New engines are added by implementing this trait; the orchestrator only
/// depends on the interface.
pub trait ScanEngine: Send + Sync {
    /// Stable engine identifier, used as the ledger key.
    fn name(&self) -> &str;

    /// Build the command that scans `path`.
    fn scan_command(&self, path: &Path) -> Command;

    /// Map the engine's exit status and output to a verdict.
    fn parse_verdict(&self, output: &EngineOutput) -> ScanVerdict;

    /// Build the command that prints the installed engine version.
    fn version_command(&self) -> Command;

    /// Extract the version string from the version command's output.
    fn parse_version(&self, output: &EngineOutput) -> Option<String>;
}

// =============================================================================
// ClamAV (clamscan / clamdscan)
// =============================================================================

fn default_clamscan_program() -> PathBuf {
    PathBuf::from("clamscan")
}

/// `ClamAV` command line scanner.
///
/// Exit codes: 0 = clean, 1 = virus found, 2 = error.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClamScanEngine {
    /// Binary to invoke (`clamscan` or `clamdscan`).
    #[serde(default = "default_clamscan_program")]
    pub program: PathBuf,
    /// Extra arguments inserted before the file path.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ClamScanEngine {
    fn default() -> Self {
        Self {
            program: default_clamscan_program(),
            extra_args: Vec::new(),
        }
    }
}

impl ClamScanEngine {
    /// Extract the signature name from a `<path>: <signature> FOUND` line.
    fn signature(stdout: &str) -> Option<String> {
        stdout
            .lines()
            .map(str::trim)
            .find(|l| l.ends_with(" FOUND"))
            .map(|line| {
                line.rsplit_once(": ")
                    .map_or("unknown", |(_, s)| s.trim_end_matches(" FOUND"))
                    .to_string()
            })
    }
}

impl ScanEngine for ClamScanEngine {
    fn name(&self) -> &str {
        "clamav"
    }

    fn scan_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--no-summary").args(&self.extra_args).arg(path);
        cmd
    }

    fn parse_verdict(&self, output: &EngineOutput) -> ScanVerdict {
        match output.status {
            Some(0) => {
                // A detection line with a clean exit code means the output is not
                // what this adapter expects; never read that as clean.
                if let Some(signature) = Self::signature(&output.stdout) {
                    warn!("clamav: detection reported with exit status 0: {signature}");
                    return ScanVerdict::Suspect(signature);
                }
                ScanVerdict::Clean
            }
            Some(1) => ScanVerdict::Suspect(
                Self::signature(&output.stdout).unwrap_or_else(|| "unknown".to_string()),
            ),
            _ => ScanVerdict::ScanFailed(output.failure_reason()),
        }
    }

    fn version_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--version");
        cmd
    }

    /// `ClamAV 1.0.3/27123/Mon Dec  1 09:00:00 2025` -> `1.0.3`
    fn parse_version(&self, output: &EngineOutput) -> Option<String> {
        if output.status != Some(0) {
            return None;
        }
        let line = EngineOutput::first_line(&output.stdout)?;
        let rest = line.strip_prefix("ClamAV ")?;
        let version = rest.split('/').next()?.trim();
        (!version.is_empty()).then(|| version.to_string())
    }
}

// =============================================================================
// Generic command engine
// =============================================================================

/// Engine driven entirely by configuration: program, arguments and the exit
/// codes that mean clean or suspect. Any other exit code is a scan failure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEngine {
    pub name: String,
    pub program: PathBuf,
    /// Arguments; `{path}` is replaced by the file path. If no argument
    /// contains the placeholder, the path is appended.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_clean_exit_codes")]
    pub clean_exit_codes: Vec<i32>,
    pub suspect_exit_codes: Vec<i32>,
    /// Program printing the version (defaults to `program`).
    #[serde(default)]
    pub version_program: Option<PathBuf>,
    #[serde(default)]
    pub version_args: Vec<String>,
}

fn default_clean_exit_codes() -> Vec<i32> {
    vec![0]
}

impl ScanEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn scan_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        let mut substituted = false;
        for arg in &self.args {
            if arg.contains(PATH_PLACEHOLDER) {
                substituted = true;
                cmd.arg(arg.replace(PATH_PLACEHOLDER, &path.to_string_lossy()));
            } else {
                cmd.arg(arg);
            }
        }
        if !substituted {
            cmd.arg(path);
        }
        cmd
    }

    fn parse_verdict(&self, output: &EngineOutput) -> ScanVerdict {
        let Some(code) = output.status else {
            return ScanVerdict::ScanFailed(output.failure_reason());
        };
        if self.suspect_exit_codes.contains(&code) {
            let detection = EngineOutput::first_line(&output.stdout)
                .map_or_else(|| format!("exit status {code}"), str::to_string);
            return ScanVerdict::Suspect(detection);
        }
        if self.clean_exit_codes.contains(&code) {
            return ScanVerdict::Clean;
        }
        ScanVerdict::ScanFailed(output.failure_reason())
    }

    fn version_command(&self) -> Command {
        let mut cmd = Command::new(self.version_program.as_ref().unwrap_or(&self.program));
        cmd.args(&self.version_args);
        cmd
    }

    /// Last whitespace separated token of the first output line.
    fn parse_version(&self, output: &EngineOutput) -> Option<String> {
        if output.status != Some(0) {
            return None;
        }
        EngineOutput::first_line(&output.stdout)?
            .split_whitespace()
            .last()
            .map(str::to_string)
    }
}

// =============================================================================
// Process Invocation
// =============================================================================

/// Outcome of running an engine process.
#[derive(Debug)]
pub enum Invocation {
    Completed(EngineOutput),
    TimedOut,
    Cancelled,
}

/// Run `cmd` to completion, killing it on timeout or cancellation.
pub async fn invoke(
    cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<Invocation> {
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;

    // Dropping the wait future drops the child, which kills it.
    tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => Ok(Invocation::Completed(EngineOutput::from(output?))),
            Err(_) => Ok(Invocation::TimedOut),
        },
        () = cancel.cancelled() => Ok(Invocation::Cancelled),
    }
}

/// Query the installed version of an engine. Returns `None` if the version
/// cannot be determined.
pub async fn detect_version(engine: &dyn ScanEngine, timeout: Duration) -> Option<String> {
    let never = CancellationToken::new();
    match invoke(engine.version_command(), timeout, &never).await {
        Ok(Invocation::Completed(output)) => {
            let version = engine.parse_version(&output);
            if version.is_none() {
                warn!(
                    "{}: unparseable version output ({})",
                    engine.name(),
                    output.failure_reason()
                );
            }
            version
        }
        Ok(Invocation::TimedOut) => {
            warn!("{}: version query timed out", engine.name());
            None
        }
        Ok(Invocation::Cancelled) => None,
        Err(e) => {
            warn!("{}: version query failed: {e}", engine.name());
            None
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// How verdicts from several engines combine. A `Suspect` from any engine
/// always wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CombinePolicy {
    /// Clean only if every engine reports clean.
    #[default]
    AllClean,
    /// Clean if at least one engine reports clean.
    AnyClean,
}

/// Timeout and retry settings for scans.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    /// Retries after the first attempt for failed or timed out scans.
    pub retries: u32,
    pub retry_wait: Duration,
    pub timeout_base: Duration,
    /// Additional timeout per byte of file size, in milliseconds.
    pub timeout_per_byte_ms: f64,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_wait: Duration::from_secs(5),
            timeout_base: Duration::from_secs(60),
            timeout_per_byte_ms: 0.0001,
        }
    }
}

impl ScanPolicy {
    /// `timeout_base + timeout_per_byte_ms * size`, saturating at `Duration::MAX`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn timeout_for(&self, size: u64) -> Duration {
        let extra_ms = (self.timeout_per_byte_ms * size as f64).max(0.0);
        let extra = Duration::try_from_secs_f64(extra_ms / 1000.0).unwrap_or(Duration::MAX);
        self.timeout_base.saturating_add(extra)
    }
}

/// Final verdict of one engine after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineReport {
    pub engine: String,
    pub verdict: ScanVerdict,
    pub attempts: u32,
}

impl EngineReport {
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Combined scan result for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub verdict: ScanVerdict,
    pub engines: Vec<EngineReport>,
}

impl ScanReport {
    /// Largest number of retries any engine needed.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.engines
            .iter()
            .map(EngineReport::retries)
            .max()
            .unwrap_or(0)
    }
}

/// Scan interrupted by shutdown.
#[derive(Debug, thiserror::Error)]
#[error("scan cancelled")]
pub struct ScanCancelled;

/// Hook invoked each time an engine attempt is about to be retried.
pub trait RetryObserver: Sync {
    fn retrying(&self, engine: &str, attempt: u32, verdict: &ScanVerdict);
}

struct NoObserver;

impl RetryObserver for NoObserver {
    fn retrying(&self, _engine: &str, _attempt: u32, _verdict: &ScanVerdict) {}
}

/// Runs every enabled engine against a staged file and combines the verdicts.
pub struct ScanOrchestrator {
    engines: Vec<Arc<dyn ScanEngine>>,
    policy: ScanPolicy,
    combine: CombinePolicy,
}

impl ScanOrchestrator {
    #[must_use]
    pub fn new(
        engines: Vec<Arc<dyn ScanEngine>>,
        policy: ScanPolicy,
        combine: CombinePolicy,
    ) -> Self {
        Self {
            engines,
            policy,
            combine,
        }
    }

    /// Scan the staged copy with all engines concurrently.
    pub async fn scan(
        &self,
        staged: &Path,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, ScanCancelled> {
        self.scan_observed(staged, size, cancel, &NoObserver).await
    }

    /// Like [`Self::scan`], reporting every retry to `observer`.
    pub async fn scan_observed(
        &self,
        staged: &Path,
        size: u64,
        cancel: &CancellationToken,
        observer: &dyn RetryObserver,
    ) -> Result<ScanReport, ScanCancelled> {
        let timeout = self.policy.timeout_for(size);
        debug!(
            "Scanning {} ({size} bytes, timeout {}ms, {} engines)",
            staged.display(),
            timeout.as_millis(),
            self.engines.len()
        );

        let reports = try_join_all(
            self.engines
                .iter()
                .map(|engine| {
                    self.scan_with_engine(engine.as_ref(), staged, timeout, cancel, observer)
                }),
        )
        .await?;

        let verdict = combine_verdicts(self.combine, &reports);
        Ok(ScanReport {
            verdict,
            engines: reports,
        })
    }

    /// Scan with one engine, retrying failed and timed out attempts.
    async fn scan_with_engine(
        &self,
        engine: &dyn ScanEngine,
        staged: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
        observer: &dyn RetryObserver,
    ) -> Result<EngineReport, ScanCancelled> {
        let max_attempts = self.policy.retries.saturating_add(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let verdict = match invoke(engine.scan_command(staged), timeout, cancel).await {
                Ok(Invocation::Completed(output)) => engine.parse_verdict(&output),
                Ok(Invocation::TimedOut) => ScanVerdict::ScanTimedOut,
                Ok(Invocation::Cancelled) => return Err(ScanCancelled),
                Err(e) => {
                    error!("{}: failed to start scan: {e}", engine.name());
                    ScanVerdict::ScanFailed(format!("failed to start engine: {e}"))
                }
            };

            if !verdict.is_retryable() {
                return Ok(EngineReport {
                    engine: engine.name().to_string(),
                    verdict,
                    attempts,
                });
            }

            if attempts >= max_attempts {
                let reason = if let ScanVerdict::ScanFailed(reason) = verdict {
                    format!("{reason} ({attempts} attempts)")
                } else {
                    format!(
                        "timed out after {}ms ({attempts} attempts)",
                        timeout.as_millis()
                    )
                };
                error!(
                    "{}: giving up on {}: {reason}",
                    engine.name(),
                    staged.display()
                );
                return Ok(EngineReport {
                    engine: engine.name().to_string(),
                    verdict: ScanVerdict::ScanFailed(reason),
                    attempts,
                });
            }

            warn!(
                "{}: attempt {attempts}/{max_attempts} for {} was {}, retrying in {}ms",
                engine.name(),
                staged.display(),
                verdict.label(),
                self.policy.retry_wait.as_millis()
            );
            observer.retrying(engine.name(), attempts, &verdict);

            tokio::select! {
                () = tokio::time::sleep(self.policy.retry_wait) => {}
                () = cancel.cancelled() => return Err(ScanCancelled),
            }
        }
    }
}

/// Combine per-engine verdicts. Never yields `Clean` without at least one
/// engine reporting clean.
#[must_use]
pub fn combine_verdicts(policy: CombinePolicy, reports: &[EngineReport]) -> ScanVerdict {
    let detections: Vec<String> = reports
        .iter()
        .filter_map(|r| match &r.verdict {
            ScanVerdict::Suspect(sig) => Some(format!("{}: {sig}", r.engine)),
            _ => None,
        })
        .collect();
    if !detections.is_empty() {
        return ScanVerdict::Suspect(detections.join("; "));
    }

    let clean = reports
        .iter()
        .filter(|r| r.verdict == ScanVerdict::Clean)
        .count();
    let resolved = match policy {
        CombinePolicy::AllClean => !reports.is_empty() && clean == reports.len(),
        CombinePolicy::AnyClean => clean > 0,
    };
    if resolved {
        if clean < reports.len() {
            info!("Accepting clean verdict from {clean}/{} engines", reports.len());
        }
        return ScanVerdict::Clean;
    }

    if reports.is_empty() {
        return ScanVerdict::ScanFailed("no scanner engines enabled".to_string());
    }

    let failures: Vec<String> = reports
        .iter()
        .filter_map(|r| match &r.verdict {
            ScanVerdict::ScanFailed(reason) => Some(format!("{}: {reason}", r.engine)),
            ScanVerdict::ScanTimedOut => Some(format!("{}: timed out", r.engine)),
            _ => None,
        })
        .collect();
    ScanVerdict::ScanFailed(failures.join("; "))
}
