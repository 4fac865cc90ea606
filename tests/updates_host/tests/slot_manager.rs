// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for slot manager safety properties
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 6 tests (2 property-based)
//!
//! TEST_SCOPE:
//!   - The boot-selected or running slot is never written
//!   - Boot attempts are bounded by the configured limit
//!   - Rollback without a known-good slot changes nothing
//!   - Interrupted installs leave the slot empty and the active slot untouched

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use proptest::prelude::*;
use updates::slots::{MemoryBootSelector, MemorySlotStorage, MemoryStateStore, StorageFault};
use updates::{
    BootAttempt, BootSelector, CancelToken, Slot, SlotError, SlotManager, SlotState,
    VerifiedBundle,
};
use updates_host::{build_bundle, slot_config, verify, Rig, DEVICES};

fn shared_bundle() -> VerifiedBundle {
    static BUNDLE: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = BUNDLE.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = build_bundle(dir.path(), "2.0.0", None);
        (dir, path)
    });
    verify(path)
}

fn device(slot: Slot) -> &'static str {
    match slot {
        Slot::A => DEVICES[0],
        Slot::B => DEVICES[1],
    }
}

fn any_slot() -> impl Strategy<Value = Slot> {
    prop_oneof![Just(Slot::A), Just(Slot::B)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn selected_or_running_slot_is_never_written(
        active in any_slot(),
        running in any_slot(),
        target in any_slot(),
    ) {
        let mut config = slot_config(3);
        config.running_slot = Some(running);
        let storage = MemorySlotStorage::new();
        let manager = SlotManager::open(
            &config,
            Arc::new(MemoryBootSelector::new(active)),
            Arc::new(MemoryStateStore::new()),
            Arc::new(storage.clone()),
        )
        .expect("open");
        let before = manager.status().record(target).clone();

        let result = manager.install(target, &shared_bundle(), &CancelToken::new());
        if target == active || target == running {
            prop_assert!(
                matches!(result, Err(SlotError::SlotBusy { .. })),
                "expected busy, got {:?}",
                result
            );
            prop_assert!(storage.contents(device(target)).is_none());
            let after = manager.status();
            prop_assert_eq!(after.record(target), &before);
        } else {
            prop_assert!(result.is_ok(), "{:?}", result);
            prop_assert_eq!(manager.status().record(target).state, SlotState::Installed);
        }
    }

    #[test]
    fn boot_attempts_are_bounded(limit in 1u32..6) {
        let rig = Rig::new(limit);
        rig.stage(&shared_bundle());

        for attempts in 1..limit {
            let outcome = rig.reboot().manager.record_boot_attempt(Slot::B).expect("attempt");
            prop_assert_eq!(outcome, BootAttempt::Counted { attempts, limit });
        }
        let last = rig.reboot().manager.record_boot_attempt(Slot::B).expect("attempt");
        prop_assert_eq!(last, BootAttempt::AutoRollbackTriggered { failed: Slot::B, restored: Slot::A });
        prop_assert_eq!(rig.selector.get_active_slot().expect("selector"), Slot::A);
    }
}

#[test]
fn test_rollback_without_good_slot_changes_nothing() {
    let rig = Rig::new(2);
    rig.stage(&shared_bundle());
    let booted = rig.reboot();
    booted.manager.record_boot_attempt(Slot::B).expect("attempt");

    // Overwriting the fallback while slot-1 is still on probation.
    booted.manager.install(Slot::A, &shared_bundle(), &CancelToken::new()).expect("install");
    let before = booted.manager.status();
    let saves = rig.store.saves();

    assert!(matches!(booted.manager.rollback(), Err(SlotError::NoGoodSlot)));
    assert!(matches!(booted.manager.record_boot_attempt(Slot::B), Err(SlotError::NoGoodSlot)));

    let after = booted.manager.status();
    assert_eq!(after.active, Slot::B);
    assert_eq!(after.record(Slot::A).state, SlotState::Installed);
    assert_eq!(after.record(Slot::B).state, SlotState::Booted);
    assert_eq!(rig.selector.get_active_slot().expect("selector"), Slot::B);
    // only the attempt counter moved
    assert_eq!(after.record(Slot::B).boot_attempts, before.record(Slot::B).boot_attempts + 1);
    assert_eq!(rig.store.saves(), saves + 1);
}

#[test]
fn test_interrupted_install_leaves_slot_empty() {
    let rig = Rig::new(3);
    let bundle = shared_bundle();
    rig.storage.set_fault(StorageFault { fail_after: Some(1024), ..Default::default() });

    let err = rig.manager.install(Slot::B, &bundle, &CancelToken::new()).expect_err("write fails");
    assert_eq!(err.kind(), "write");
    let status = rig.manager.status();
    assert_eq!(status.record(Slot::B).state, SlotState::Empty);
    assert_eq!(status.record(Slot::B).installed_version, None);
    assert_eq!(status.active, Slot::A);
    assert_eq!(status.record(Slot::A).state, SlotState::Good);
    assert!(matches!(rig.manager.activate(Slot::B), Err(SlotError::NotBootable { .. })));

    rig.storage.set_fault(StorageFault::default());
    rig.manager.install(Slot::B, &bundle, &CancelToken::new()).expect("retry");
    assert_eq!(rig.manager.status().record(Slot::B).state, SlotState::Installed);
}

#[test]
fn test_corrupt_readback_is_rejected() {
    let rig = Rig::new(3);
    rig.storage.set_fault(StorageFault { corrupt_readback: true, ..Default::default() });

    let err = rig.manager.install(Slot::B, &shared_bundle(), &CancelToken::new()).expect_err("readback");
    assert!(matches!(err, SlotError::Write { slot: Slot::B, .. }), "{err}");
    assert_eq!(rig.manager.status().record(Slot::B).state, SlotState::Empty);
}

#[test]
fn test_cancelled_install_touches_nothing() {
    let rig = Rig::new(3);
    let cancel = CancelToken::new();
    cancel.cancel();

    let saves = rig.store.saves();
    assert!(matches!(
        rig.manager.install(Slot::B, &shared_bundle(), &cancel),
        Err(SlotError::Cancelled)
    ));
    assert_eq!(rig.store.saves(), saves);
    assert!(rig.storage.contents(DEVICES[1]).is_none());
}
