// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Host integration tests for the updates library (bundles, slots, client)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: fixtures only; scenarios live in tests/
//!
//! Shared fixtures: tar-image bundles built from throwaway rootfs trees and a
//! slot manager wired to in-memory selector, store and devices.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use updates::bundle::{BuildOptions, BundleBuilder, TarImageFormatter};
use updates::slots::{MemoryBootSelector, MemorySlotStorage, MemoryStateStore};
use updates::{CancelToken, Slot, SlotManager, SlotManagerConfig, VerifiedBundle, VerifyPolicy};

/// Compatibility id used by every fixture.
pub const COMPAT: &str = "board-x";

/// Device names of the two in-memory slots.
pub const DEVICES: [&str; 2] = ["/dev/mmcblk0p2", "/dev/mmcblk0p3"];

/// Deterministic signing key derived from `seed`.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Writes a small rootfs tree for `version` under `dir`.
pub fn write_rootfs(dir: &Path, version: &str) -> PathBuf {
    let root = dir.join(format!("rootfs-{version}"));
    fs::create_dir_all(root.join("etc")).expect("rootfs");
    fs::create_dir_all(root.join("usr/bin")).expect("rootfs");
    fs::write(root.join("etc/os-release"), format!("VERSION_ID={version}\n")).expect("write");
    fs::write(root.join("usr/bin/app"), vec![0x7f; 3000]).expect("write");
    root
}

/// Builds `<dir>/<version>.bundle` with a tar image, optionally signed.
pub fn build_bundle(dir: &Path, version: &str, key: Option<&SigningKey>) -> PathBuf {
    build_bundle_for(dir, version, COMPAT, key)
}

/// Same as [`build_bundle`] for another compatibility id.
pub fn build_bundle_for(dir: &Path, version: &str, compatible: &str, key: Option<&SigningKey>) -> PathBuf {
    let rootfs = write_rootfs(dir, version);
    let output = dir.join(format!("{version}.bundle"));
    let mut builder = BundleBuilder::new(rootfs, version, compatible)
        .options(BuildOptions {
            min_image_size: 0,
            build_timestamp: Some(1_700_000_000),
            ..Default::default()
        })
        .formatter(TarImageFormatter);
    if let Some(key) = key {
        builder = builder.signing_key(key.clone());
    }
    builder.build(&output).expect("build bundle");
    output
}

/// Verifies `path` with an unsigned policy for [`COMPAT`].
pub fn verify(path: &Path) -> VerifiedBundle {
    updates::verify_bundle(path, &VerifyPolicy::unsigned(COMPAT)).expect("verify bundle")
}

/// Slot manager over in-memory selector, store and devices.
#[derive(Clone)]
pub struct Rig {
    pub selector: Arc<MemoryBootSelector>,
    pub store: Arc<MemoryStateStore>,
    pub storage: MemorySlotStorage,
    pub manager: Arc<SlotManager>,
    limit: u32,
}

impl Rig {
    /// Fresh device booted from slot-0 with `limit` boot attempts per slot.
    pub fn new(limit: u32) -> Self {
        let selector = Arc::new(MemoryBootSelector::new(Slot::A));
        let store = Arc::new(MemoryStateStore::new());
        let storage = MemorySlotStorage::new();
        let manager = open(&selector, &store, &storage, limit);
        Self { selector, store, storage, manager, limit }
    }

    /// Simulates a reboot: the bootloader starts whatever slot is selected.
    pub fn reboot(&self) -> Self {
        let manager = open(&self.selector, &self.store, &self.storage, self.limit);
        Self { manager, ..self.clone() }
    }

    /// Installs and activates `bundle` into the inactive slot.
    pub fn stage(&self, bundle: &VerifiedBundle) -> Slot {
        let target = self.manager.active_slot().other();
        self.manager.install(target, bundle, &CancelToken::new()).expect("install");
        self.manager.activate(target).expect("activate");
        target
    }
}

/// Slot configuration shared by every rig.
pub fn slot_config(limit: u32) -> SlotManagerConfig {
    SlotManagerConfig {
        devices: DEVICES.map(String::from),
        boot_attempts_limit: [limit; 2],
        factory_version: "1.0.0".into(),
        running_slot: None,
    }
}

fn open(
    selector: &Arc<MemoryBootSelector>,
    store: &Arc<MemoryStateStore>,
    storage: &MemorySlotStorage,
    limit: u32,
) -> Arc<SlotManager> {
    let manager = SlotManager::open(
        &slot_config(limit),
        selector.clone(),
        store.clone(),
        Arc::new(storage.clone()),
    )
    .expect("open slot manager");
    Arc::new(manager)
}

/// Byte offset and length of archive entry `name` inside `bundle`.
pub fn entry_span(bundle: &[u8], name: &str) -> (usize, usize) {
    let mut archive = tar::Archive::new(std::io::Cursor::new(bundle));
    for entry in archive.entries().expect("entries") {
        let entry = entry.expect("entry");
        let path = entry.path().expect("path").to_string_lossy().into_owned();
        if path == name {
            return (entry.raw_file_position() as usize, entry.size() as usize);
        }
    }
    panic!("entry {name} not in bundle");
}
