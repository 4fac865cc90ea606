// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Slot device access: streaming writes plus read-back.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Streaming writer into a slot device.
pub trait SlotWriter: Write + Send {
    /// Flushes and syncs everything written so far.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Opens slot devices by their opaque identifier.
pub trait SlotStorage: Send + Sync {
    /// Opens `device` for a full rewrite. Existing content stays intact until
    /// the first write or `finish`.
    fn open_writer(&self, device: &str) -> io::Result<Box<dyn SlotWriter>>;

    /// Opens `device` for reading from the start.
    fn open_reader(&self, device: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Block devices or image files addressed by path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSlotStorage;

struct FileWriter {
    file: File,
    truncate: bool,
}

impl FileWriter {
    fn begin(&mut self) -> io::Result<()> {
        if std::mem::take(&mut self.truncate) {
            self.file.set_len(0)?;
        }
        Ok(())
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.begin()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SlotWriter for FileWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.begin()?;
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl SlotStorage for FileSlotStorage {
    fn open_writer(&self, device: &str) -> io::Result<Box<dyn SlotWriter>> {
        let file = OpenOptions::new().write(true).open(device)?;
        // Image files shrink with their content; block devices keep their size.
        let truncate = file.metadata()?.is_file();
        Ok(Box::new(FileWriter { file, truncate }))
    }

    fn open_reader(&self, device: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(device)?))
    }
}

/// Faults [`MemorySlotStorage`] can inject.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageFault {
    /// `open_writer` fails.
    pub fail_open: bool,
    /// Writes fail once this many bytes were accepted.
    pub fail_after: Option<u64>,
    /// `finish` fails.
    pub fail_sync: bool,
    /// Read-back flips the first byte.
    pub corrupt_readback: bool,
}

/// In-memory devices for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct MemorySlotStorage {
    inner: Arc<Mutex<MemoryDevices>>,
}

#[derive(Debug, Default)]
struct MemoryDevices {
    devices: HashMap<String, Vec<u8>>,
    fault: StorageFault,
}

impl MemorySlotStorage {
    /// Storage with no devices yet; writers create them on open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fault profile for subsequent operations.
    pub fn set_fault(&self, fault: StorageFault) {
        self.inner.lock().fault = fault;
    }

    /// Current contents of `device`.
    pub fn contents(&self, device: &str) -> Option<Vec<u8>> {
        self.inner.lock().devices.get(device).cloned()
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<MemoryDevices>>,
    device: String,
    written: u64,
    started: bool,
}

impl MemoryWriter {
    fn begin(&mut self, inner: &mut MemoryDevices) {
        if !std::mem::replace(&mut self.started, true) {
            inner.devices.insert(self.device.clone(), Vec::new());
        }
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let shared = Arc::clone(&self.inner);
        let mut inner = shared.lock();
        self.begin(&mut inner);
        if let Some(limit) = inner.fault.fail_after {
            if self.written + buf.len() as u64 > limit {
                return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
            }
        }
        inner.devices.entry(self.device.clone()).or_default().extend_from_slice(buf);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SlotWriter for MemoryWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let shared = Arc::clone(&self.inner);
        let mut inner = shared.lock();
        self.begin(&mut inner);
        if inner.fault.fail_sync {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        Ok(())
    }
}

impl SlotStorage for MemorySlotStorage {
    fn open_writer(&self, device: &str) -> io::Result<Box<dyn SlotWriter>> {
        let inner = self.inner.lock();
        if inner.fault.fail_open {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("no device {device}")));
        }
        Ok(Box::new(MemoryWriter {
            inner: Arc::clone(&self.inner),
            device: device.into(),
            written: 0,
            started: false,
        }))
    }

    fn open_reader(&self, device: &str) -> io::Result<Box<dyn Read + Send>> {
        let inner = self.inner.lock();
        let mut bytes = inner
            .devices
            .get(device)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {device}")))?;
        if inner.fault.corrupt_readback {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xFF;
            }
        }
        Ok(Box::new(Cursor::new(bytes)))
    }
}
