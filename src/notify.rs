// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Operator alerts for detections and terminal failures.
//!
//! Alerts are fire-and-forget: delivery runs on a background task and a
//! failure is logged, never returned to the caller.
//!
//! Transports:
//! - Unix socket: one line `<category>: <subject>: <detail>`
//! - Command: `<command> <category> <subject>` with the detail on stdin

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::task::TaskTracker;

/// Default notification socket path.
pub const DEFAULT_NOTIFY_SOCKET: &str = "/run/clamav/notify.sock";

/// Upper bound for a notification command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Alert category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertCategory {
    Detection,
    ScanFailure,
    IntegrityFailure,
    StagingFailure,
    ArchiveFailure,
    DiskSpace,
    Startup,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Detection => "detection",
            Self::ScanFailure => "scan-failure",
            Self::IntegrityFailure => "integrity-failure",
            Self::StagingFailure => "staging-failure",
            Self::ArchiveFailure => "archive-failure",
            Self::DiskSpace => "disk-space",
            Self::Startup => "startup",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Transports {
    socket: Option<PathBuf>,
    command: Option<PathBuf>,
}

/// Fire-and-forget alert sender.
#[derive(Debug, Clone)]
pub struct Notifier {
    transports: Arc<Transports>,
    tracker: TaskTracker,
}

impl Notifier {
    #[must_use]
    pub fn new(socket: Option<PathBuf>, command: Option<PathBuf>) -> Self {
        Self {
            transports: Arc::new(Transports { socket, command }),
            tracker: TaskTracker::new(),
        }
    }

    /// Create a notifier that only logs.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Queue an alert. Never blocks and never fails.
    pub fn notify(&self, category: AlertCategory, subject: &str, detail: &str) {
        warn!("Alert [{category}] {subject}: {detail}");

        let transports = Arc::clone(&self.transports);
        if transports.socket.is_none() && transports.command.is_none() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Alert [{category}] not delivered: no async runtime");
            return;
        };

        let subject = subject.to_owned();
        let detail = detail.to_owned();
        self.tracker.spawn_on(
            async move {
                if let Some(socket) = &transports.socket {
                    send_socket(socket, category, &subject, &detail).await;
                }
                if let Some(command) = &transports.command {
                    run_command(command, category, &subject, &detail).await;
                }
            },
            &handle,
        );
    }

    /// Wait up to `timeout` for queued alerts to be delivered.
    pub async fn flush(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!("Alerts still pending after {}ms", timeout.as_millis());
        }
        self.tracker.reopen();
    }
}

/// Send an alert line to the notification socket.
///
/// Skips silently if the socket doesn't exist.
async fn send_socket(socket: &Path, category: AlertCategory, subject: &str, detail: &str) {
    if !socket.exists() {
        return;
    }

    let message = format!("{category}: {subject}: {detail}\n");
    match UnixStream::connect(socket).await {
        Ok(mut stream) => {
            if let Err(e) = stream.write_all(message.as_bytes()).await {
                warn!("Failed to write to notification socket: {e}");
            } else {
                debug!("Notification sent: {}", message.trim_end());
            }
        }
        Err(e) => {
            warn!("Notification socket unavailable: {e}");
        }
    }
}

/// Invoke the notification command with the detail on stdin.
async fn run_command(command: &Path, category: AlertCategory, subject: &str, detail: &str) {
    let child = tokio::process::Command::new(command)
        .arg(category.to_string())
        .arg(subject)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to start notification command {}: {e}", command.display());
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(detail.as_bytes()).await {
            warn!("Failed to write notification body: {e}");
        }
    }

    match tokio::time::timeout(COMMAND_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => debug!("Notification command succeeded"),
        Ok(Ok(status)) => warn!("Notification command exited with {status}"),
        Ok(Err(e)) => warn!("Notification command failed: {e}"),
        Err(_) => warn!("Notification command timed out"),
    }
}
