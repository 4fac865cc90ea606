// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable storage of the slot table.

use std::fs;
use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::SlotTable;
use crate::write_atomic;

/// On-disk format version of the slot table.
pub const STATE_VERSION: u32 = 1;

/// Errors produced by state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Stored bytes could not be decoded.
    #[error("corrupt state: {0}")]
    Corrupt(String),
    /// Stored table uses an unknown format version.
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
}

/// Durable home of the slot table.
pub trait StateStore: Send + Sync {
    /// Loads the table; `None` when nothing was ever stored.
    fn load(&self) -> Result<Option<SlotTable>, StoreError>;

    /// Durably replaces the stored table.
    fn save(&self, table: &SlotTable) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    version: u32,
    #[serde(flatten)]
    table: SlotTable,
}

/// JSON file store; writes go to a synced temp file that replaces the target.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<SlotTable>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let persisted: Persisted =
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        if persisted.version != STATE_VERSION {
            return Err(StoreError::UnsupportedVersion(persisted.version));
        }
        if !persisted.table.is_consistent() {
            return Err(StoreError::Corrupt("slot records out of order".into()));
        }
        Ok(Some(persisted.table))
    }

    fn save(&self, table: &SlotTable) -> Result<(), StoreError> {
        let persisted = Persisted { version: STATE_VERSION, table: table.clone() };
        let bytes = serde_json::to_vec_pretty(&persisted)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

/// In-memory store with failure injection.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    table: Option<SlotTable>,
    fail_saves: bool,
    saves: usize,
}

impl MemoryStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `table`.
    pub fn with_table(table: SlotTable) -> Self {
        Self { inner: Mutex::new(MemoryInner { table: Some(table), ..Default::default() }) }
    }

    /// Makes subsequent saves fail.
    pub fn fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.inner.lock().saves
    }

    /// Last saved table.
    pub fn snapshot(&self) -> Option<SlotTable> {
        self.inner.lock().table.clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<SlotTable>, StoreError> {
        Ok(self.inner.lock().table.clone())
    }

    fn save(&self, table: &SlotTable) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_saves {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "injected save failure")));
        }
        inner.table = Some(table.clone());
        inner.saves += 1;
        Ok(())
    }
}
