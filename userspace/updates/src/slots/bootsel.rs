// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot selection backends.
//!
//! The selector is the only thing the bootloader reads, so every backend must
//! switch slots atomically: either the old or the new value survives a power
//! cut, never a torn one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use super::Slot;
use crate::write_atomic;

/// Errors produced by boot selectors.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Stored value is not a slot.
    #[error("invalid boot selection: {0}")]
    Invalid(String),
    /// Environment tool failed.
    #[error("{tool} failed: {detail}")]
    Tool {
        /// Tool name.
        tool: String,
        /// Exit status and stderr.
        detail: String,
    },
}

/// Firmware-level boot slot selection.
pub trait BootSelector: Send + Sync {
    /// Slot the bootloader will start next.
    fn get_active_slot(&self) -> Result<Slot, SelectorError>;

    /// Atomically selects `slot` for the next boot.
    fn set_active_slot(&self, slot: Slot) -> Result<(), SelectorError>;
}

/// In-memory selector for tests and simulations.
#[derive(Debug)]
pub struct MemoryBootSelector {
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    active: Slot,
    fail_writes: bool,
    writes: usize,
}

impl MemoryBootSelector {
    /// Selector starting on `active`.
    pub fn new(active: Slot) -> Self {
        Self { state: Mutex::new(MemoryState { active, fail_writes: false, writes: 0 }) }
    }

    /// Makes subsequent `set_active_slot` calls fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Number of successful selections.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }
}

impl BootSelector for MemoryBootSelector {
    fn get_active_slot(&self) -> Result<Slot, SelectorError> {
        Ok(self.state.lock().active)
    }

    fn set_active_slot(&self, slot: Slot) -> Result<(), SelectorError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(SelectorError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected selector failure",
            )));
        }
        state.active = slot;
        state.writes += 1;
        Ok(())
    }
}

/// `key=value` environment file, rewritten via temp file and rename.
#[derive(Debug, Clone)]
pub struct EnvFileBootSelector {
    path: PathBuf,
    key: String,
    default: Slot,
}

impl EnvFileBootSelector {
    /// Selector stored under `key` in `path`; `default` applies while unset.
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>, default: Slot) -> Self {
        Self { path: path.into(), key: key.into(), default }
    }

    fn read_lines(&self) -> Result<Vec<String>, SelectorError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl BootSelector for EnvFileBootSelector {
    fn get_active_slot(&self) -> Result<Slot, SelectorError> {
        for line in self.read_lines()? {
            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == self.key {
                    return value.parse().map_err(SelectorError::Invalid);
                }
            }
        }
        Ok(self.default)
    }

    fn set_active_slot(&self, slot: Slot) -> Result<(), SelectorError> {
        let mut lines = self.read_lines()?;
        let entry = format!("{}={}", self.key, slot.as_str());
        match lines.iter_mut().find(|line| {
            line.split_once('=').is_some_and(|(key, _)| key.trim() == self.key)
        }) {
            Some(line) => *line = entry,
            None => lines.push(entry),
        }
        let mut text = lines.join("\n");
        text.push('\n');
        write_atomic(&self.path, text.as_bytes())?;
        debug!("bootsel: {} {}={}", self.path.display(), self.key, slot);
        Ok(())
    }
}

/// U-Boot environment accessed through `fw_printenv` / `fw_setenv`.
#[derive(Debug, Clone)]
pub struct UbootEnvSelector {
    variable: String,
    printenv: PathBuf,
    setenv: PathBuf,
}

impl UbootEnvSelector {
    /// Selector backed by U-Boot variable `variable`, using tools from `PATH`.
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            printenv: PathBuf::from("fw_printenv"),
            setenv: PathBuf::from("fw_setenv"),
        }
    }

    /// Overrides the tool locations.
    pub fn with_tools(mut self, printenv: impl Into<PathBuf>, setenv: impl Into<PathBuf>) -> Self {
        self.printenv = printenv.into();
        self.setenv = setenv.into();
        self
    }
}

impl BootSelector for UbootEnvSelector {
    fn get_active_slot(&self) -> Result<Slot, SelectorError> {
        let output = Command::new(&self.printenv).arg("-n").arg(&self.variable).output()?;
        if !output.status.success() {
            return Err(tool_error(&self.printenv, &output));
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().map_err(SelectorError::Invalid)
    }

    fn set_active_slot(&self, slot: Slot) -> Result<(), SelectorError> {
        let output = Command::new(&self.setenv).arg(&self.variable).arg(slot.letter()).output()?;
        if !output.status.success() {
            return Err(tool_error(&self.setenv, &output));
        }
        debug!("bootsel: u-boot {}={}", self.variable, slot.letter());
        Ok(())
    }
}

fn tool_error(tool: &Path, output: &std::process::Output) -> SelectorError {
    SelectorError::Tool {
        tool: tool.display().to_string(),
        detail: format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}
