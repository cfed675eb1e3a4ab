// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::notify::{DEFAULT_NOTIFY_SOCKET, Notifier};
use crate::scanner::{ClamScanEngine, CombinePolicy, CommandEngine, ScanEngine, ScanPolicy};
use crate::throttle::ThrottleLimits;

pub const LEDGER_FILE: &str = "ledger.json";
pub const STATUS_FILE: &str = "status.json";
pub const THROTTLE_FILE: &str = "throttle.json";
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Hazard archive configuration.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ArchiveConfig {
    /// Encrypt and archive detections (default: false, keep in quarantine).
    pub enable: bool,
    /// Archive directory.
    pub path: Option<PathBuf>,
    /// Base64 encoded X25519 public key of the offline recipient.
    pub public_key: Option<PathBuf>,
}

/// Scanner engine selection.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EngineConfig {
    Clamscan(ClamScanEngine),
    Command(CommandEngine),
}

impl EngineConfig {
    #[must_use]
    pub fn build(&self) -> Arc<dyn ScanEngine> {
        match self {
            Self::Clamscan(engine) => Arc::new(engine.clone()),
            Self::Command(engine) => Arc::new(engine.clone()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Clamscan(engine) => engine.name(),
            Self::Command(engine) => engine.name(),
        }
    }
}

/// Retry and timeout settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanConfig {
    /// Retries after the first failed or timed out attempt (default: 2).
    pub retries: u32,
    /// Fixed wait between attempts (default: 5000ms).
    pub retry_wait_ms: u64,
    /// Timeout for an empty file (default: 60000ms).
    pub timeout_base_ms: u64,
    /// Timeout added per byte of file size (default: 0.0001ms, 100s per GB).
    pub timeout_per_byte_ms: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_wait_ms: 5000,
            timeout_base_ms: 60_000,
            timeout_per_byte_ms: 0.0001,
        }
    }
}

/// Operator notification configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct NotifyConfig {
    /// Enable notifications (default: true).
    /// Notifications are also skipped if the socket doesn't exist.
    pub enable: bool,
    /// Default: /run/clamav/notify.sock
    pub socket: Option<PathBuf>,
    /// Command invoked as `<command> <category> <subject>`, detail on stdin.
    pub command: Option<PathBuf>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enable: true,
            socket: Some(PathBuf::from(DEFAULT_NOTIFY_SOCKET)),
            command: None,
        }
    }
}

impl NotifyConfig {
    #[must_use]
    pub fn build(&self) -> Notifier {
        if self.enable {
            Notifier::new(self.socket.clone(), self.command.clone())
        } else {
            Notifier::disabled()
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_workers() -> usize {
    4
}

/// Pipeline configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Directory scanned for candidate files.
    pub inbound: PathBuf,
    /// Isolated working area for staged copies.
    pub staging: PathBuf,
    /// Where clean files are delivered (relative layout preserved).
    pub destination: PathBuf,
    /// Holding area for suspect and failed files.
    pub quarantine: PathBuf,
    /// Ledger, status, throttle counters and audit trail.
    pub state_dir: PathBuf,

    #[serde(default)]
    pub archive: ArchiveConfig,

    pub engines: Vec<EngineConfig>,

    #[serde(default)]
    pub combine_policy: CombinePolicy,

    #[serde(default)]
    pub throttle: ThrottleLimits,

    #[serde(default)]
    pub scan: ScanConfig,

    /// Remove the inbound file once its delivered copy is verified (default: true).
    #[serde(default = "default_true")]
    pub delete_source_on_success: bool,

    /// Remove the inbound file as soon as its staged copy is verified.
    #[serde(default)]
    pub delete_on_admit: bool,

    /// Parallel workers (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Filename patterns never admitted.
    /// Examples: `.crdownload`, `.part`, `.tmp`, `~$`
    #[serde(default)]
    pub ignore_file_patterns: Vec<String>,

    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Check if a path is an accessible directory.
fn check_dir(dir: &Path) -> Result<(), &'static str> {
    match dir.metadata() {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err("is not a directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => Err("does not exist"),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err("permission denied"),
        Err(_) => Err("is not accessible"),
    }
}

impl PipelineConfig {
    /// Read and parse a configuration file.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_data = fs::read(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let config: Self =
            serde_json::from_slice(&config_data).context("Failed to parse config JSON")?;
        info!(
            "Loaded configuration with {} engines from {}",
            config.engines.len(),
            config_path.display()
        );
        Ok(config)
    }

    /// Validate configuration.
    /// Returns `Ok(())` if valid, or `Err(Vec<String>)` with error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = check_dir(&self.inbound) {
            errors.push(format!("Inbound directory {} {e}", self.inbound.display()));
        }

        let areas = [
            ("staging", &self.staging),
            ("destination", &self.destination),
            ("quarantine", &self.quarantine),
            ("stateDir", &self.state_dir),
        ];
        for (name, dir) in areas {
            if dir.starts_with(&self.inbound) || self.inbound.starts_with(dir) {
                errors.push(format!(
                    "'{name}' {} overlaps inbound {}",
                    dir.display(),
                    self.inbound.display()
                ));
            }
        }
        for (i, (a_name, a)) in areas.iter().enumerate() {
            for (b_name, b) in &areas[i + 1..] {
                if a == b {
                    errors.push(format!("'{a_name}' and '{b_name}' are the same directory"));
                }
            }
        }

        if self.engines.is_empty() {
            errors.push("No scanner engines configured".to_string());
        }
        let mut names = HashSet::new();
        for engine in &self.engines {
            if !names.insert(engine.name()) {
                errors.push(format!("Duplicate engine name '{}'", engine.name()));
            }
        }

        if self.archive.enable {
            if self.archive.path.is_none() {
                errors.push("archive.path is required when archiving is enabled".to_string());
            }
            match &self.archive.public_key {
                None => errors
                    .push("archive.publicKey is required when archiving is enabled".to_string()),
                Some(key) if !key.is_file() => {
                    errors.push(format!("Archive public key {} does not exist", key.display()));
                }
                Some(_) => {}
            }
        }

        if self.workers == 0 {
            errors.push("workers must be at least 1".to_string());
        }
        if !self.scan.timeout_per_byte_ms.is_finite() || self.scan.timeout_per_byte_ms < 0.0 {
            errors.push("scan.timeoutPerByteMs must be a non-negative number".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Log configuration info.
    pub fn log_config_info(&self) {
        let names: Vec<_> = self.engines.iter().map(EngineConfig::name).collect();
        info!("Engines: {names:?} (combine: {:?})", self.combine_policy);
        info!(
            "Scan policy: {} retries, {}ms wait, timeout {}ms + {}ms/byte",
            self.scan.retries,
            self.scan.retry_wait_ms,
            self.scan.timeout_base_ms,
            self.scan.timeout_per_byte_ms
        );
        if self.archive.enable {
            info!("Hazard archive enabled");
        } else {
            info!("Hazard archive disabled (detections stay in quarantine)");
        }
        if !self.delete_source_on_success {
            info!("Source files are kept after delivery");
        }
        if self.delete_on_admit {
            info!("Source files are removed after staging");
        }
        if !self.notify.enable {
            info!("Notifications disabled");
        }
        if !self.ignore_file_patterns.is_empty() {
            debug!("Ignoring file patterns: {:?}", self.ignore_file_patterns);
        }
        debug!("Throttle limits: {:?}", self.throttle);
    }

    #[must_use]
    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            retries: self.scan.retries,
            retry_wait: Duration::from_millis(self.scan.retry_wait_ms),
            timeout_base: Duration::from_millis(self.scan.timeout_base_ms),
            timeout_per_byte_ms: self.scan.timeout_per_byte_ms,
        }
    }

    #[must_use]
    pub fn build_engines(&self) -> Vec<Arc<dyn ScanEngine>> {
        self.engines.iter().map(EngineConfig::build).collect()
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join(LEDGER_FILE)
    }

    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join(STATUS_FILE)
    }

    #[must_use]
    pub fn throttle_path(&self) -> PathBuf {
        self.state_dir.join(THROTTLE_FILE)
    }

    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.state_dir.join(AUDIT_FILE)
    }
}

/// Verify configuration file without running the pipeline.
pub fn verify_config(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;

    if let Err(errors) = config.validate() {
        for err in &errors {
            eprintln!("{err}");
        }
        anyhow::bail!("Configuration has {} errors", errors.len());
    }

    eprintln!("Configuration valid");
    Ok(())
}
