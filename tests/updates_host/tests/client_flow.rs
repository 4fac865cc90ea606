// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for the update client job flow
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 6 tests
//!
//! TEST_SCENARIOS:
//!   - test_update_reboot_and_complete(): poll, reboot, confirm across the journal
//!   - test_failed_verification_keeps_active_slot(): tampered download rejected
//!   - test_cancel_reboot_restores_previous_slot()
//!   - test_failed_boot_fails_journaled_job(): rollback reported after reboot
//!   - test_incompatible_candidate_ignored()
//!   - test_rebooter_failure_allows_retry()

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use updates::{
    BootSelector, CheckOutcome, ClientConfig, ClientError, DirectorySource, JobState, Rebooter,
    Slot, SlotState, UpdateClient, VerifyPolicy,
};
use updates_host::{build_bundle, build_bundle_for, entry_span, Rig, COMPAT};

#[derive(Default)]
struct CountingRebooter {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl Rebooter for CountingRebooter {
    fn reboot(&self) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err("reboot refused".into());
        }
        Ok(())
    }
}

struct Device {
    dir: tempfile::TempDir,
    rig: Rig,
    rebooter: Arc<CountingRebooter>,
}

impl Device {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("source")).expect("source dir");
        Self { dir, rig: Rig::new(2), rebooter: Arc::default() }
    }

    fn source_dir(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    fn journal(&self) -> PathBuf {
        self.dir.path().join("state/job.json")
    }

    fn publish(&self, version: &str) -> PathBuf {
        build_bundle(&self.source_dir(), version, None)
    }

    fn client(&self, rig: &Rig, reboot_delay: Duration) -> UpdateClient {
        UpdateClient::new(
            ClientConfig {
                compatible: COMPAT.into(),
                work_dir: self.dir.path().join("work"),
                journal_path: self.journal(),
                reboot_delay,
                history_limit: 4,
            },
            Arc::clone(&rig.manager),
            Arc::new(DirectorySource::new(self.source_dir())),
            VerifyPolicy::unsigned(COMPAT),
            self.rebooter.clone(),
        )
    }
}

fn scheduled(outcome: CheckOutcome) -> updates::UpdateJob {
    match outcome {
        CheckOutcome::Scheduled(job) => job,
        other => panic!("expected scheduled job, got {other:?}"),
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).map(|mut entries| entries.next().is_none()).unwrap_or(true)
}

#[test]
fn test_update_reboot_and_complete() {
    let device = Device::new();
    device.publish("2.0.0");
    let client = device.client(&device.rig, Duration::ZERO);

    let job = scheduled(client.check_for_update().expect("check"));
    assert_eq!(job.state, JobState::AwaitingReboot);
    assert_eq!((job.previous, job.target), (Slot::A, Slot::B));
    assert_eq!(device.rig.selector.get_active_slot().expect("selector"), Slot::B);
    assert!(device.journal().exists());
    assert!(is_empty_dir(&device.dir.path().join("work")), "download must be cleaned up");
    assert_eq!(client.pending_job().map(|job| job.id), Some(job.id.clone()));

    // One job at a time until the reboot happens.
    assert_eq!(client.check_for_update().expect("check"), CheckOutcome::Busy);
    assert!(client.reboot_if_due().expect("reboot"));
    assert!(!client.reboot_if_due().expect("reboot"));
    assert_eq!(device.rebooter.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(client.cancel_reboot(), Err(ClientError::RebootIssued)));

    let booted = device.rig.reboot();
    booted.manager.record_boot_attempt(Slot::B).expect("attempt");
    let after_boot = device.client(&booted, Duration::ZERO);
    let waiting = after_boot.resume_after_boot().expect("resume").expect("journaled job");
    assert_eq!(waiting.state, JobState::Confirming);
    assert!(device.journal().exists());

    booted.manager.confirm(Slot::B).expect("confirm");
    let done = after_boot.resume_after_boot().expect("resume").expect("journaled job");
    assert_eq!(done.id, job.id);
    assert_eq!(done.state, JobState::Completed);
    assert!(!device.journal().exists());
    assert_eq!(after_boot.history().len(), 1);

    assert_eq!(
        after_boot.check_for_update().expect("check"),
        CheckOutcome::UpToDate { version: "2.0.0".into() }
    );
}

#[test]
fn test_failed_verification_keeps_active_slot() {
    let device = Device::new();
    let path = device.publish("2.0.0");
    let mut bytes = fs::read(&path).expect("read");
    let (offset, _) = entry_span(&bytes, "rootfs.img");
    bytes[offset + 10] ^= 0xff;
    fs::write(&path, bytes).expect("write");

    let client = device.client(&device.rig, Duration::ZERO);
    let job = match client.check_for_update().expect("check") {
        CheckOutcome::Failed(job) => job,
        other => panic!("expected failed job, got {other:?}"),
    };
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure.as_deref().is_some_and(|reason| reason.contains("integrity")), "{job:?}");

    let status = device.rig.manager.status();
    assert_eq!(status.active, Slot::A);
    assert_eq!(status.record(Slot::A).state, SlotState::Good);
    assert_eq!(status.record(Slot::B).state, SlotState::Empty);
    assert_eq!(device.rebooter.calls.load(Ordering::SeqCst), 0);
    assert!(client.pending_job().is_none());
    assert!(!device.journal().exists());
    assert!(is_empty_dir(&device.dir.path().join("work")));
}

#[test]
fn test_cancel_reboot_restores_previous_slot() {
    let device = Device::new();
    device.publish("2.0.0");
    let client = device.client(&device.rig, Duration::from_secs(3600));

    scheduled(client.check_for_update().expect("check"));
    assert!(!client.reboot_if_due().expect("not due yet"));

    let job = client.cancel_reboot().expect("cancel");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure.as_deref(), Some("reboot cancelled"));
    assert_eq!(device.rig.selector.get_active_slot().expect("selector"), Slot::A);
    assert_eq!(device.rig.manager.status().record(Slot::A).state, SlotState::Good);
    assert!(!device.journal().exists());
    assert!(client.pending_job().is_none());
    assert!(matches!(client.cancel_reboot(), Err(ClientError::NoPendingReboot)));
    assert_eq!(device.rebooter.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_boot_fails_journaled_job() {
    let device = Device::new();
    device.publish("2.0.0");
    let client = device.client(&device.rig, Duration::ZERO);
    scheduled(client.check_for_update().expect("check"));

    // Two boots without a verdict exhaust the limit of 2.
    device.rig.reboot().manager.record_boot_attempt(Slot::B).expect("attempt");
    device.rig.reboot().manager.record_boot_attempt(Slot::B).expect("attempt");

    let restored = device.rig.reboot();
    assert_eq!(restored.manager.running_slot(), Slot::A);
    let after_boot = device.client(&restored, Duration::ZERO);
    let job = after_boot.resume_after_boot().expect("resume").expect("journaled job");
    assert_eq!(job.state, JobState::Failed);
    assert!(!device.journal().exists());

    // The version that failed here is not retried.
    assert_eq!(
        after_boot.check_for_update().expect("check"),
        CheckOutcome::UpToDate { version: "2.0.0".into() }
    );
}

#[test]
fn test_incompatible_candidate_ignored() {
    let device = Device::new();
    build_bundle_for(&device.source_dir(), "9.0.0", "board-y", None);
    let client = device.client(&device.rig, Duration::ZERO);

    assert_eq!(
        client.check_for_update().expect("check"),
        CheckOutcome::Incompatible { found: "board-y".into() }
    );
    assert_eq!(device.rig.manager.status().record(Slot::B).state, SlotState::Empty);
}

#[test]
fn test_rebooter_failure_allows_retry() {
    let device = Device::new();
    device.publish("2.0.0");
    let client = device.client(&device.rig, Duration::ZERO);
    scheduled(client.check_for_update().expect("check"));

    device.rebooter.fail.store(true, Ordering::SeqCst);
    assert!(!client.reboot_if_due().expect("reboot"));
    device.rebooter.fail.store(false, Ordering::SeqCst);
    assert!(client.reboot_if_due().expect("reboot"));
    assert_eq!(device.rebooter.calls.load(Ordering::SeqCst), 2);
}
