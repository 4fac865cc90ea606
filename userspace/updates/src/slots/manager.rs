// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Slot manager: the only writer of slot state.
//!
//! Every transition clones the table, mutates the clone, persists it and only
//! then swaps it in, so the in-memory view never runs ahead of the store.

use std::io::{Read, Write};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use super::{
    BootAttempt, BootSelector, CancelToken, Slot, SlotError, SlotRecord, SlotState, SlotStatus,
    SlotStorage, SlotTable, StateStore, SLOT_IMAGE,
};
use crate::bundle::{hash_stream, ImageEntry, Sha256Digest, VerifiedBundle};

/// Static slot configuration applied on every open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotManagerConfig {
    /// Device identifiers for slot-0 and slot-1.
    pub devices: [String; 2],
    /// Boot attempts allowed before rollback, per slot.
    pub boot_attempts_limit: [u32; 2],
    /// Version recorded for the boot-selected slot on first provisioning.
    pub factory_version: String,
    /// Slot the system runs from; the boot-selected slot when unset.
    pub running_slot: Option<Slot>,
}

struct Inner {
    table: SlotTable,
    active: Slot,
}

/// Owner of the persistent slot table.
pub struct SlotManager {
    selector: Arc<dyn BootSelector>,
    store: Arc<dyn StateStore>,
    storage: Arc<dyn SlotStorage>,
    running: Slot,
    inner: Mutex<Inner>,
    install_lock: Mutex<()>,
    snapshot: RwLock<Arc<SlotStatus>>,
}

impl SlotManager {
    /// Loads (or provisions) the slot table and applies `config`.
    pub fn open(
        config: &SlotManagerConfig,
        selector: Arc<dyn BootSelector>,
        store: Arc<dyn StateStore>,
        storage: Arc<dyn SlotStorage>,
    ) -> Result<Self, SlotError> {
        let active = selector.get_active_slot()?;
        let loaded = store.load()?;
        let provisioned = loaded.is_none();
        let mut table = loaded.unwrap_or_else(|| provision(config, active));
        for slot in Slot::ALL {
            let record = table.get_mut(slot);
            record.device = config.devices[slot.index()].clone();
            record.boot_attempts_limit = config.boot_attempts_limit[slot.index()].max(1);
        }
        store.save(&table)?;
        if provisioned {
            info!(
                "slots: provisioned slot={} as good version={}",
                active, config.factory_version
            );
        }

        let running = config.running_slot.unwrap_or(active);
        let status = SlotStatus { table: table.clone(), active, running };
        Ok(Self {
            selector,
            store,
            storage,
            running,
            inner: Mutex::new(Inner { table, active }),
            install_lock: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(status)),
        })
    }

    /// Snapshot of both slots, the boot-selected slot and the running slot.
    pub fn status(&self) -> Arc<SlotStatus> {
        Arc::clone(&self.snapshot.read())
    }

    /// Slot the system is running from.
    pub fn running_slot(&self) -> Slot {
        self.running
    }

    /// Boot-selected slot.
    pub fn active_slot(&self) -> Slot {
        self.inner.lock().active
    }

    /// Writes the bundle's image into `slot`.
    pub fn install(
        &self,
        slot: Slot,
        bundle: &VerifiedBundle,
        cancel: &CancelToken,
    ) -> Result<(), SlotError> {
        let _installing = self.install_lock.try_lock().ok_or(SlotError::SlotBusy {
            slot,
            reason: "another install is in flight",
        })?;

        let device = {
            let inner = self.inner.lock();
            self.check_writable(&inner, slot)?;
            inner.table.get(slot).device.clone()
        };
        if cancel.is_cancelled() {
            info!("slots: slot={} install cancelled before start", slot);
            return Err(SlotError::Cancelled);
        }

        let image = select_image(bundle)?.clone();
        let mut writer = self.storage.open_writer(&device).map_err(|err| SlotError::Write {
            slot,
            reason: format!("open {device}: {err}"),
        })?;
        if cancel.is_cancelled() {
            info!("slots: slot={} install cancelled before first byte", slot);
            return Err(SlotError::Cancelled);
        }

        // Point of no return: the slot is invalid until read-back succeeds.
        // Selection may have moved while the device was opening.
        {
            let mut inner = self.inner.lock();
            self.check_writable(&inner, slot)?;
            let mut next = inner.table.clone();
            let record = next.get_mut(slot);
            record.state = SlotState::Empty;
            record.installed_version = None;
            record.boot_attempts = 0;
            self.store.save(&next)?;
            inner.table = next;
            self.publish(&inner);
        }
        info!(
            "slots: slot={} installing version={} from {} ({} bytes)",
            slot,
            bundle.version(),
            bundle.path().display(),
            image.size
        );

        let written = self
            .stream_image(bundle, &image, writer.as_mut())
            .and_then(|()| writer.finish().map_err(|err| format!("sync: {err}")))
            .and_then(|()| self.read_back(&device, &image));
        if let Err(reason) = written {
            warn!("slots: slot={} install failed, slot left empty: {}", slot, reason);
            return Err(SlotError::Write { slot, reason });
        }

        let version = bundle.version().to_string();
        self.transition(|table| {
            let record = table.get_mut(slot);
            record.state = SlotState::Installed;
            record.installed_version = Some(version.clone());
            record.boot_attempts = 0;
            Ok(())
        })?;
        info!("slots: slot={} installed version={}", slot, version);
        Ok(())
    }

    /// Selects `slot` for the next boot.
    pub fn activate(&self, slot: Slot) -> Result<(), SlotError> {
        let mut inner = self.inner.lock();
        let previous = inner.table.clone();
        let state = previous.get(slot).state;
        if !state.is_bootable() {
            return Err(SlotError::NotBootable { slot, state });
        }

        let mut next = previous.clone();
        if state == SlotState::Installed {
            let record = next.get_mut(slot);
            record.state = SlotState::Booted;
            record.boot_attempts = 0;
        }
        self.store.save(&next)?;
        if let Err(err) = self.selector.set_active_slot(slot) {
            warn!("slots: slot={} activation failed: {}", slot, err);
            if let Err(restore) = self.store.save(&previous) {
                error!("slots: failed to restore slot table after selector error: {}", restore);
            }
            return Err(err.into());
        }
        inner.table = next;
        inner.active = slot;
        self.publish(&inner);
        info!("slots: slot={} activated state={}", slot, inner.table.get(slot).state);
        Ok(())
    }

    /// Counts one boot of `slot`; rolls back once the limit is reached.
    pub fn record_boot_attempt(&self, slot: Slot) -> Result<BootAttempt, SlotError> {
        let mut inner = self.inner.lock();
        let record = inner.table.get(slot).clone();
        match record.state {
            SlotState::Good => Ok(BootAttempt::Confirmed),
            SlotState::Booted => {
                let attempts = record.boot_attempts.saturating_add(1);
                let limit = record.boot_attempts_limit;
                let mut next = inner.table.clone();
                next.get_mut(slot).boot_attempts = attempts;
                self.store.save(&next)?;
                inner.table = next;
                self.publish(&inner);
                info!("slots: slot={} boot attempt {}/{}", slot, attempts, limit);

                if attempts < limit {
                    return Ok(BootAttempt::Counted { attempts, limit });
                }
                warn!("slots: slot={} exhausted {} boot attempts, rolling back", slot, limit);
                let restored = self.rollback_locked(&mut inner, slot)?;
                Ok(BootAttempt::AutoRollbackTriggered { failed: slot, restored })
            }
            state => Err(SlotError::InvalidTransition { op: "record_boot_attempt", slot, state }),
        }
    }

    /// Marks the boot-selected, Booted `slot` as Good. Only the slot the
    /// system is running from can be confirmed.
    pub fn confirm(&self, slot: Slot) -> Result<(), SlotError> {
        let mut inner = self.inner.lock();
        let state = inner.table.get(slot).state;
        if slot != inner.active || slot != self.running {
            return Err(SlotError::InvalidTransition { op: "confirm", slot, state });
        }
        match state {
            SlotState::Good => {
                debug!("slots: slot={} already good", slot);
                Ok(())
            }
            SlotState::Booted => {
                let mut next = inner.table.clone();
                let record = next.get_mut(slot);
                record.state = SlotState::Good;
                record.boot_attempts = 0;
                self.store.save(&next)?;
                inner.table = next;
                self.publish(&inner);
                info!("slots: slot={} confirmed good", slot);
                Ok(())
            }
            state => Err(SlotError::InvalidTransition { op: "confirm", slot, state }),
        }
    }

    /// Marks the boot-selected slot Bad and selects the other, known-good one.
    pub fn rollback(&self) -> Result<Slot, SlotError> {
        let mut inner = self.inner.lock();
        let failed = inner.active;
        self.rollback_locked(&mut inner, failed)
    }

    fn rollback_locked(&self, inner: &mut Inner, failed: Slot) -> Result<Slot, SlotError> {
        let target = failed.other();
        let target_state = inner.table.get(target).state;
        if target_state != SlotState::Good {
            error!(
                "slots: OPERATOR ALERT rollback from slot={} impossible: slot={} is {}, no known-good slot",
                failed, target, target_state
            );
            return Err(SlotError::NoGoodSlot);
        }

        let previous = inner.table.clone();
        let mut next = previous.clone();
        next.get_mut(failed).state = SlotState::Bad;
        self.store.save(&next)?;
        if let Err(err) = self.selector.set_active_slot(target) {
            error!("slots: rollback slot={} -> slot={} failed: {}", failed, target, err);
            if let Err(restore) = self.store.save(&previous) {
                error!("slots: failed to restore slot table after selector error: {}", restore);
            }
            return Err(err.into());
        }
        inner.table = next;
        inner.active = target;
        self.publish(inner);
        warn!("slots: rolled back slot={} -> slot={}", failed, target);
        Ok(target)
    }

    fn check_writable(&self, inner: &Inner, slot: Slot) -> Result<(), SlotError> {
        if slot == inner.active {
            return Err(SlotError::SlotBusy { slot, reason: "slot is boot-selected" });
        }
        if slot == self.running {
            return Err(SlotError::SlotBusy { slot, reason: "system is running from slot" });
        }
        Ok(())
    }

    fn transition(
        &self,
        mutate: impl FnOnce(&mut SlotTable) -> Result<(), SlotError>,
    ) -> Result<(), SlotError> {
        let mut inner = self.inner.lock();
        let mut next = inner.table.clone();
        mutate(&mut next)?;
        self.store.save(&next)?;
        inner.table = next;
        self.publish(&inner);
        Ok(())
    }

    fn publish(&self, inner: &Inner) {
        let status =
            SlotStatus { table: inner.table.clone(), active: inner.active, running: self.running };
        *self.snapshot.write() = Arc::new(status);
    }

    fn stream_image<W: Write + ?Sized>(
        &self,
        bundle: &VerifiedBundle,
        image: &ImageEntry,
        writer: &mut W,
    ) -> Result<(), String> {
        let (_, mut reader) = bundle
            .open_image(&image.name)
            .map_err(|err| format!("open image: {err}"))?
            .ok_or_else(|| format!("image `{}` vanished", image.name))?;
        let mut hasher = HashingWriter::new(writer);
        let copied = std::io::copy(&mut reader, &mut hasher).map_err(|err| format!("write: {err}"))?;
        if copied != image.size {
            return Err(format!("short copy: {copied} of {} bytes", image.size));
        }
        if hasher.digest() != image.sha256 {
            return Err("image changed since verification".into());
        }
        Ok(())
    }

    fn read_back(&self, device: &str, image: &ImageEntry) -> Result<(), String> {
        let reader = self.storage.open_reader(device).map_err(|err| format!("read-back open: {err}"))?;
        let mut limited = reader.take(image.size);
        let (digest, len) = hash_stream(&mut limited).map_err(|err| format!("read-back: {err}"))?;
        if len != image.size {
            return Err(format!("read-back returned {len} of {} bytes", image.size));
        }
        if digest != image.sha256 {
            return Err("read-back digest mismatch".into());
        }
        Ok(())
    }
}

fn provision(config: &SlotManagerConfig, active: Slot) -> SlotTable {
    let record = |slot: Slot| {
        let good = slot == active;
        SlotRecord {
            slot,
            device: config.devices[slot.index()].clone(),
            installed_version: good.then(|| config.factory_version.clone()),
            state: if good { SlotState::Good } else { SlotState::Empty },
            boot_attempts: 0,
            boot_attempts_limit: config.boot_attempts_limit[slot.index()],
        }
    };
    SlotTable { slots: [record(Slot::A), record(Slot::B)] }
}

fn select_image(bundle: &VerifiedBundle) -> Result<&ImageEntry, SlotError> {
    let images = &bundle.manifest().images;
    if let Some(image) = images.get(SLOT_IMAGE) {
        return Ok(image);
    }
    let mut iter = images.values();
    match (iter.next(), iter.next()) {
        (Some(only), None) => Ok(only),
        _ => Err(SlotError::MissingImage(format!(
            "no `{SLOT_IMAGE}` image among {} images",
            images.len()
        ))),
    }
}

struct HashingWriter<'a, W: Write + ?Sized> {
    inner: &'a mut W,
    hasher: Sha256,
}

impl<'a, W: Write + ?Sized> HashingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, hasher: Sha256::new() }
    }

    fn digest(self) -> Sha256Digest {
        self.hasher.finalize().into()
    }
}

impl<W: Write + ?Sized> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
