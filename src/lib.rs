// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Version-gated malware scanning and quarantine pipeline.
//!
//! Files found in an inbound area are admitted under disk space and volume
//! quotas, copied to an isolated staging area, scanned by one or more
//! external engines and then delivered, quarantined, or sealed into an
//! encrypted hazard archive. Nothing is processed unless every engine's
//! installed version has passed a recorded self-test.
//!
//! # Modules
//!
//! - [`pipeline`] - Coordinator: startup gate, admission and worker pool
//! - [`status`] - Fail-closed status gate and persisted pipeline status
//! - [`ledger`] - Version ledger of self-tested engine versions
//! - [`scanner`] - Engine adapters and the scan orchestrator
//! - [`selftest`] - Engine self-test that feeds the version ledger
//! - [`throttle`] - Disk space and quota admission control
//! - [`quarantine`] - Staging, delivery, quarantine and archival moves
//! - [`archive`] - Write-only encrypted hazard archive
//! - [`integrity`] - SHA-256 content digests
//! - [`task`] - Per-file state machine
//! - [`audit`] - JSON lines audit trail
//! - [`notify`] - Fire-and-forget operator alerts

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc)]

pub mod archive;
pub mod audit;
pub mod config;
pub mod integrity;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod quarantine;
pub mod scanner;
pub mod selftest;
pub mod status;
pub mod task;
pub mod throttle;
pub mod util;
