// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Persistent A/B slot model and boot state machine
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests in manager.rs + tests/updates_host/tests/slot_manager.rs
//!   - install guards (busy, cancel, interrupted write)
//!   - activate / confirm / bounded boot attempts
//!   - rollback and NoGoodSlot
//!
//! Slot lifecycle:
//!
//! ```text
//!  Empty --install--> Installed --activate--> Booted --confirm--> Good
//!    ^                                          |
//!    +------- install (invalidates) ----------- | --attempts >= limit--> Bad
//! ```

pub mod bootsel;
pub mod device;
pub mod manager;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bootsel::{BootSelector, EnvFileBootSelector, MemoryBootSelector, SelectorError, UbootEnvSelector};
pub use device::{FileSlotStorage, MemorySlotStorage, SlotStorage, SlotWriter, StorageFault};
pub use manager::{SlotManager, SlotManagerConfig};
pub use store::{FileStateStore, MemoryStateStore, StateStore, StoreError};

/// Image class a slot is written from when the bundle carries several.
pub const SLOT_IMAGE: &str = "rootfs";

/// One of the two boot targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    /// First slot (`slot-0`).
    #[serde(rename = "slot-0")]
    A,
    /// Second slot (`slot-1`).
    #[serde(rename = "slot-1")]
    B,
}

impl Slot {
    /// Both slots in index order.
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// The rollback partner of this slot.
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Stable identifier (`slot-0` / `slot-1`).
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::A => "slot-0",
            Slot::B => "slot-1",
        }
    }

    /// Bootloader letter (`A` / `B`).
    pub fn letter(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "slot-0" | "a" | "A" | "0" => Ok(Slot::A),
            "slot-1" | "b" | "B" | "1" => Ok(Slot::B),
            other => Err(format!("unknown slot `{other}`")),
        }
    }
}

/// Persistent slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// No usable content.
    Empty,
    /// Content written and verified, never booted.
    Installed,
    /// Selected for boot, not yet confirmed healthy.
    Booted,
    /// Confirmed healthy.
    Good,
    /// Failed to prove itself; never auto-selected.
    Bad,
}

impl SlotState {
    /// Whether `activate` accepts a slot in this state.
    pub fn is_bootable(self) -> bool {
        matches!(self, SlotState::Installed | SlotState::Booted | SlotState::Good)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Empty => "empty",
            SlotState::Installed => "installed",
            SlotState::Booted => "booted",
            SlotState::Good => "good",
            SlotState::Bad => "bad",
        };
        f.write_str(name)
    }
}

/// Persistent attributes of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Slot this record describes.
    pub slot: Slot,
    /// Opaque block device identifier.
    pub device: String,
    /// Version of the installed content, if any.
    pub installed_version: Option<String>,
    /// Current state.
    pub state: SlotState,
    /// Boots attempted since activation.
    pub boot_attempts: u32,
    /// Attempts allowed before automatic rollback.
    pub boot_attempts_limit: u32,
}

/// Both slot records, indexed by [`Slot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTable {
    /// Records for slot-0 and slot-1, in that order.
    pub slots: [SlotRecord; 2],
}

impl SlotTable {
    /// Returns the record for `slot`.
    pub fn get(&self, slot: Slot) -> &SlotRecord {
        &self.slots[slot.index()]
    }

    /// Returns the mutable record for `slot`.
    pub fn get_mut(&mut self, slot: Slot) -> &mut SlotRecord {
        &mut self.slots[slot.index()]
    }

    /// Checks that every record sits at its own index.
    pub fn is_consistent(&self) -> bool {
        Slot::ALL.iter().all(|slot| self.get(*slot).slot == *slot)
    }
}

/// Read-only view published after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    /// Both records.
    pub table: SlotTable,
    /// Boot-selected slot.
    pub active: Slot,
    /// Slot the system is running from.
    pub running: Slot,
}

impl SlotStatus {
    /// Record for `slot`.
    pub fn record(&self, slot: Slot) -> &SlotRecord {
        self.table.get(slot)
    }

    /// Record of the boot-selected slot.
    pub fn active_record(&self) -> &SlotRecord {
        self.table.get(self.active)
    }
}

/// Outcome of [`SlotManager::record_boot_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAttempt {
    /// Attempt counted; the slot is still on probation.
    Counted {
        /// Attempts so far.
        attempts: u32,
        /// Configured limit.
        limit: u32,
    },
    /// The limit was reached and the manager rolled back.
    AutoRollbackTriggered {
        /// Slot marked Bad.
        failed: Slot,
        /// Slot now boot-selected.
        restored: Slot,
    },
    /// The slot is already Good; nothing to count.
    Confirmed,
}

/// Errors produced by the slot manager.
#[derive(Debug, Error)]
pub enum SlotError {
    /// Slot cannot be written right now.
    #[error("{slot} busy: {reason}")]
    SlotBusy {
        /// Requested slot.
        slot: Slot,
        /// Why it is unavailable.
        reason: &'static str,
    },
    /// Writing or reading back the slot failed.
    #[error("{slot} write failed: {reason}")]
    Write {
        /// Slot being written.
        slot: Slot,
        /// What failed.
        reason: String,
    },
    /// Neither slot is known good.
    #[error("no known-good slot to roll back to")]
    NoGoodSlot,
    /// Slot cannot be booted in its current state.
    #[error("{slot} is not bootable in state {state}")]
    NotBootable {
        /// Requested slot.
        slot: Slot,
        /// Its state.
        state: SlotState,
    },
    /// Operation not allowed in the slot's current state.
    #[error("{op} not allowed on {slot} in state {state}")]
    InvalidTransition {
        /// Requested operation.
        op: &'static str,
        /// Requested slot.
        slot: Slot,
        /// Its state.
        state: SlotState,
    },
    /// The bundle carries no image the slot can take.
    #[error("bundle has no installable image: {0}")]
    MissingImage(String),
    /// Install cancelled before the first byte.
    #[error("install cancelled")]
    Cancelled,
    /// Boot selector failure.
    #[error("boot selector: {0}")]
    Selector(#[from] SelectorError),
    /// State store failure.
    #[error("state store: {0}")]
    Store(#[from] StoreError),
}

impl SlotError {
    /// Short machine-friendly error kind used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlotBusy { .. } => "slot-busy",
            Self::Write { .. } => "write",
            Self::NoGoodSlot => "no-good-slot",
            Self::NotBootable { .. } => "not-bootable",
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::MissingImage(_) => "missing-image",
            Self::Cancelled => "cancelled",
            Self::Selector(_) => "selector",
            Self::Store(_) => "store",
        }
    }
}

/// Cooperative cancellation flag shared between a caller and an install.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names_parse_back() {
        for slot in Slot::ALL {
            assert_eq!(slot.as_str().parse::<Slot>(), Ok(slot));
            assert_eq!(slot.letter().parse::<Slot>(), Ok(slot));
            assert_eq!(slot.other().other(), slot);
        }
        assert!("slot-2".parse::<Slot>().is_err());
    }

    #[test]
    fn slot_serializes_as_identifier() {
        assert_eq!(serde_json::to_string(&Slot::B).expect("json"), "\"slot-1\"");
        assert_eq!(serde_json::to_string(&SlotState::Good).expect("json"), "\"good\"");
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
