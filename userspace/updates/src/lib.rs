// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: A/B update domain library (bundles, slots, health, client)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests per module + integration tests (via tests/updates_host)
//!   - bundle build / verify / tamper detection / signature policy
//!   - slot state machine, bounded boot attempts, rollback
//!   - update client job flow and reboot handling
//!
//! PUBLIC API:
//!   - bundle: BundleBuilder, verify_bundle, VerifiedBundle, Manifest
//!   - slots: SlotManager plus BootSelector / StateStore / SlotStorage seams
//!   - health: HealthMonitor and built-in checks
//!   - client: UpdateClient, BundleSource, Rebooter
//!
//! DEPENDENCIES:
//!   - tar + toml: bundle container and manifest
//!   - sha2 + ed25519-dalek: integrity and signatures
//!   - walkdir: rootfs traversal
//!   - sysinfo: process and disk health checks
//!   - parking_lot: slot table and client locks

#![forbid(unsafe_code)]

pub mod bundle;
pub mod client;
pub mod health;
pub mod keys;
pub mod slots;

use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub use bundle::{
    build_bundle, verify_bundle, BuildError, BuildOptions, Bundle, BundleBuilder, Manifest,
    VerifiedBundle, VerifyError, VerifyPolicy,
};
pub use client::{
    BundleSource, Candidate, CheckOutcome, ClientConfig, ClientError, DirectorySource,
    DownloadError, JobState, Rebooter, UpdateClient, UpdateJob,
};
pub use health::{FailureAction, HealthCheck, HealthCheckResult, HealthMonitor, HealthVerdict};
pub use keys::{KeyError, PublicKey};
pub use slots::{
    BootAttempt, BootSelector, CancelToken, Slot, SlotError, SlotManager, SlotManagerConfig,
    SlotRecord, SlotState, SlotStatus,
};

/// Replaces `path` with `bytes` via a synced temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}
