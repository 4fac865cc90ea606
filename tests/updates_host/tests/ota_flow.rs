// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: End-to-end A/B flow: build, verify, install, boot supervision
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 4 tests
//!
//! TEST_SCENARIOS:
//!   - test_failed_boots_roll_back(): attempts exhausted, previous slot restored
//!   - test_healthy_boot_confirms(): health pass marks the new slot good
//!   - test_unhealthy_boot_rolls_back(): health failure restores the previous slot
//!   - test_second_update_lands_in_old_slot(): slots alternate after confirmation

use std::time::Duration;

use updates::health::FnCheck;
use updates::{BootAttempt, BootSelector, HealthMonitor, HealthVerdict, Slot, SlotState};
use updates_host::{build_bundle, verify, Rig, DEVICES};

#[test]
fn test_failed_boots_roll_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = verify(&build_bundle(dir.path(), "2.0.0", None));
    let rig = Rig::new(3);

    assert_eq!(rig.stage(&bundle), Slot::B);
    let image = bundle.manifest().image("rootfs").expect("rootfs image");
    let written = rig.storage.contents(DEVICES[1]).expect("slot-1 written");
    assert_eq!(written.len() as u64, image.size);

    // Boot 1 and 2 on slot-1 never reach the health verdict.
    for attempts in 1..3 {
        let booted = rig.reboot();
        assert_eq!(booted.manager.running_slot(), Slot::B);
        assert_eq!(
            booted.manager.record_boot_attempt(Slot::B).expect("attempt"),
            BootAttempt::Counted { attempts, limit: 3 }
        );
    }

    let booted = rig.reboot();
    assert_eq!(
        booted.manager.record_boot_attempt(Slot::B).expect("attempt"),
        BootAttempt::AutoRollbackTriggered { failed: Slot::B, restored: Slot::A }
    );
    assert_eq!(rig.selector.get_active_slot().expect("selector"), Slot::A);

    let status = rig.reboot().manager.status();
    assert_eq!(status.running, Slot::A);
    assert_eq!(status.record(Slot::A).state, SlotState::Good);
    assert_eq!(status.record(Slot::B).state, SlotState::Bad);
    assert_eq!(status.record(Slot::B).installed_version.as_deref(), Some("2.0.0"));
}

#[test]
fn test_healthy_boot_confirms() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rig = Rig::new(3);
    rig.stage(&verify(&build_bundle(dir.path(), "2.0.0", None)));

    let booted = rig.reboot();
    booted.manager.record_boot_attempt(Slot::B).expect("attempt");
    let monitor = HealthMonitor::new(Duration::from_secs(5))
        .with_check(FnCheck::new("app", || Ok(())));
    let run = monitor.run(&booted.manager).expect("health");

    assert_eq!(run.verdict, HealthVerdict::Confirmed(Slot::B));
    let status = booted.manager.status();
    assert_eq!(status.active, Slot::B);
    assert_eq!(status.record(Slot::B).state, SlotState::Good);
    assert_eq!(status.record(Slot::B).boot_attempts, 0);
    assert_eq!(status.record(Slot::A).state, SlotState::Good);

    // Later boots count nothing.
    assert_eq!(
        booted.reboot().manager.record_boot_attempt(Slot::B).expect("attempt"),
        BootAttempt::Confirmed
    );
}

#[test]
fn test_unhealthy_boot_rolls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rig = Rig::new(3);
    rig.stage(&verify(&build_bundle(dir.path(), "2.0.0", None)));

    let booted = rig.reboot();
    booted.manager.record_boot_attempt(Slot::B).expect("attempt");
    let monitor = HealthMonitor::new(Duration::from_secs(5))
        .with_check(FnCheck::new("app", || Err("service not listening".into())));
    let run = monitor.run(&booted.manager).expect("health");

    assert_eq!(run.verdict, HealthVerdict::RolledBack { failed: Slot::B, restored: Slot::A });
    let result = run.result.expect("evaluation");
    assert!(!result.passed);
    assert_eq!(result.checks[0].detail, "service not listening");
    assert_eq!(rig.selector.get_active_slot().expect("selector"), Slot::A);
    assert_eq!(booted.manager.status().record(Slot::B).state, SlotState::Bad);
}

#[test]
fn test_second_update_lands_in_old_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rig = Rig::new(3);
    rig.stage(&verify(&build_bundle(dir.path(), "2.0.0", None)));
    let booted = rig.reboot();
    booted.manager.record_boot_attempt(Slot::B).expect("attempt");
    booted.manager.confirm(Slot::B).expect("confirm");

    assert_eq!(booted.stage(&verify(&build_bundle(dir.path(), "3.0.0", None))), Slot::A);
    let status = booted.manager.status();
    assert_eq!(status.active, Slot::A);
    assert_eq!(status.record(Slot::A).state, SlotState::Booted);
    assert_eq!(status.record(Slot::A).installed_version.as_deref(), Some("3.0.0"));
    // slot-1 stays the fallback
    assert_eq!(status.record(Slot::B).state, SlotState::Good);
}
