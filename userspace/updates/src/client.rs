// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Device-side update client (poll -> download -> verify -> install)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests below + tests/updates_host/tests/client_flow.rs
//!   - single-flight busy guard
//!   - verification failure leaves the active slot untouched
//!   - reboot cancellation restores the previous slot
//!   - journaled job completes after reboot
//!
//! Activation is the last step of a job, so any earlier failure leaves the
//! boot-selected slot exactly as it was.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bundle::{read_manifest, verify_bundle, VerifiedBundle, VerifyPolicy, BUNDLE_EXTENSION};
use crate::slots::{CancelToken, Slot, SlotError, SlotManager, SlotState};
use crate::write_atomic;

/// Errors raised by bundle sources.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Source could not serve the request.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the update client outside a job.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Source failed while looking for a candidate.
    #[error("download: {0}")]
    Download(#[from] DownloadError),
    /// Slot manager refused an operation.
    #[error("slots: {0}")]
    Slot(#[from] SlotError),
    /// Job journal could not be read or written.
    #[error("journal: {0}")]
    Journal(String),
    /// The reboot was already handed to the system.
    #[error("reboot already issued")]
    RebootIssued,
    /// No job is waiting for a reboot.
    #[error("no reboot pending")]
    NoPendingReboot,
}

/// An update advertised by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Compatibility id declared by the bundle.
    pub compatible: String,
    /// Bundle version.
    pub version: String,
    /// Source-specific location.
    pub location: String,
}

/// Where bundles come from. Retries are the source's business.
pub trait BundleSource: Send + Sync {
    /// Newest bundle the source can offer.
    fn latest(&self) -> Result<Option<Candidate>, DownloadError>;

    /// Copies `candidate` to `dest`.
    fn fetch(&self, candidate: &Candidate, dest: &Path) -> Result<(), DownloadError>;
}

/// Local or removable directory of `*.bundle` files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    compatible: Option<String>,
}

impl DirectorySource {
    /// Source scanning `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), compatible: None }
    }

    /// Only offers bundles declaring `compatible`.
    pub fn compatible(mut self, compatible: impl Into<String>) -> Self {
        self.compatible = Some(compatible.into());
        self
    }
}

impl BundleSource for DirectorySource {
    fn latest(&self) -> Result<Option<Candidate>, DownloadError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut best: Option<Candidate> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BUNDLE_EXTENSION) {
                continue;
            }
            let manifest = match read_manifest(&path) {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!("source: skipping {}: {}", path.display(), err);
                    continue;
                }
            };
            if self.compatible.as_ref().is_some_and(|want| *want != manifest.compatible) {
                debug!("source: {} targets {}", path.display(), manifest.compatible);
                continue;
            }
            let newer = best
                .as_ref()
                .map_or(true, |current| is_newer(&manifest.version, Some(&current.version)));
            if newer {
                best = Some(Candidate {
                    compatible: manifest.compatible,
                    version: manifest.version,
                    location: path.display().to_string(),
                });
            }
        }
        Ok(best)
    }

    fn fetch(&self, candidate: &Candidate, dest: &Path) -> Result<(), DownloadError> {
        fs::copy(&candidate.location, dest)?;
        Ok(())
    }
}

/// Issues the actual system reboot.
pub trait Rebooter: Send + Sync {
    /// Reboots; returning at all means the request was accepted.
    fn reboot(&self) -> Result<(), String>;
}

/// Reboots by running a command.
#[derive(Debug, Clone)]
pub struct CommandRebooter {
    program: String,
    args: Vec<String>,
}

impl CommandRebooter {
    /// Rebooter running `program args...`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

impl Rebooter for CommandRebooter {
    fn reboot(&self) -> Result<(), String> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .map_err(|err| format!("spawn {}: {err}", self.program))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {status}", self.program))
        }
    }
}

/// Lifecycle of an update job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Created, nothing done yet.
    Pending,
    /// Fetching the bundle.
    Downloading,
    /// Verifying the fetched bundle.
    Verifying,
    /// Hooks, slot write and activation.
    Installing,
    /// Activated; waiting for the reboot.
    AwaitingReboot,
    /// Rebooted; waiting for the health verdict.
    Confirming,
    /// Gave up; see `failure`.
    Failed,
    /// New slot confirmed.
    Completed,
}

impl JobState {
    /// Whether the job still occupies the client.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            JobState::Pending
                | JobState::Downloading
                | JobState::Verifying
                | JobState::Installing
                | JobState::AwaitingReboot
        )
    }
}

/// One update attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJob {
    /// Job identifier.
    pub id: String,
    /// Bundle being installed.
    pub candidate: Candidate,
    /// Slot being written.
    pub target: Slot,
    /// Slot that was boot-selected when the job started.
    pub previous: Slot,
    /// Current state.
    pub state: JobState,
    /// Failure reason when `state` is Failed.
    pub failure: Option<String>,
    /// Creation time, unix milliseconds.
    pub created_ms: u64,
}

impl UpdateJob {
    fn advance(&mut self, state: JobState) {
        debug!("client: job={} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("client: job={} failed in {:?}: {}", self.id, self.state, reason);
        self.state = JobState::Failed;
        self.failure = Some(reason);
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another job is in flight; nothing was done.
    Busy,
    /// Source offered nothing.
    NoCandidate,
    /// Candidate targets another device class.
    Incompatible {
        /// Compatibility id the candidate declares.
        found: String,
    },
    /// Candidate is not newer, or previously failed.
    UpToDate {
        /// Candidate version.
        version: String,
    },
    /// Job finished installing; reboot scheduled.
    Scheduled(UpdateJob),
    /// Job failed; active slot untouched.
    Failed(UpdateJob),
}

/// Update client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Compatibility id of this device.
    pub compatible: String,
    /// Scratch directory for downloads and hooks.
    pub work_dir: PathBuf,
    /// Journal of the job awaiting reboot.
    pub journal_path: PathBuf,
    /// Delay between activation and reboot.
    pub reboot_delay: Duration,
    /// Finished jobs kept in memory.
    pub history_limit: usize,
}

struct PendingReboot {
    job: UpdateJob,
    due: Instant,
}

/// Single-flight update driver.
pub struct UpdateClient {
    config: ClientConfig,
    manager: Arc<SlotManager>,
    source: Arc<dyn BundleSource>,
    policy: VerifyPolicy,
    rebooter: Arc<dyn Rebooter>,
    busy: AtomicBool,
    reboot_issued: AtomicBool,
    pending: Mutex<Option<PendingReboot>>,
    history: Mutex<VecDeque<UpdateJob>>,
    install_cancel: Mutex<Option<CancelToken>>,
    sequence: AtomicU64,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UpdateClient {
    /// Creates a client installing through `manager`.
    pub fn new(
        config: ClientConfig,
        manager: Arc<SlotManager>,
        source: Arc<dyn BundleSource>,
        policy: VerifyPolicy,
        rebooter: Arc<dyn Rebooter>,
    ) -> Self {
        Self {
            config,
            manager,
            source,
            policy,
            rebooter,
            busy: AtomicBool::new(false),
            reboot_issued: AtomicBool::new(false),
            pending: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            install_cancel: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Polls the source once and runs a job when a newer bundle exists.
    pub fn check_for_update(&self) -> Result<CheckOutcome, ClientError> {
        if self.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            debug!("client: poll skipped, job in flight");
            return Ok(CheckOutcome::Busy);
        }
        let _guard = BusyGuard(&self.busy);
        if self.pending.lock().is_some() {
            debug!("client: poll skipped, reboot pending");
            return Ok(CheckOutcome::Busy);
        }

        let Some(candidate) = self.source.latest()? else {
            debug!("client: no candidate");
            return Ok(CheckOutcome::NoCandidate);
        };
        if candidate.compatible != self.config.compatible {
            warn!(
                "client: candidate version={} targets {}, device is {}",
                candidate.version, candidate.compatible, self.config.compatible
            );
            return Ok(CheckOutcome::Incompatible { found: candidate.compatible });
        }

        let status = self.manager.status();
        let installed = status.active_record().installed_version.as_deref();
        if !is_newer(&candidate.version, installed) {
            debug!("client: version={} not newer than {:?}", candidate.version, installed);
            return Ok(CheckOutcome::UpToDate { version: candidate.version });
        }
        let failed_before = Slot::ALL.iter().any(|slot| {
            let record = status.record(*slot);
            record.state == SlotState::Bad
                && record.installed_version.as_deref() == Some(candidate.version.as_str())
        });
        if failed_before {
            info!("client: version={} previously failed on this device, skipping", candidate.version);
            return Ok(CheckOutcome::UpToDate { version: candidate.version });
        }

        let mut job = UpdateJob {
            id: self.next_job_id(),
            candidate,
            target: status.active.other(),
            previous: status.active,
            state: JobState::Pending,
            failure: None,
            created_ms: unix_ms(),
        };
        info!(
            "client: job={} version={} -> slot={}",
            job.id, job.candidate.version, job.target
        );

        let download = self.config.work_dir.join(format!("{}.{BUNDLE_EXTENSION}", job.id));
        let result = self.run_job(&mut job, &download);
        remove_quietly(&download);
        remove_quietly(&self.hook_path(&job));
        *self.install_cancel.lock() = None;

        match result {
            Ok(()) => {
                job.advance(JobState::AwaitingReboot);
                if let Err(err) = self.write_journal(&job) {
                    error!("client: job={} journal write failed: {}", job.id, err);
                }
                let due = Instant::now() + self.config.reboot_delay;
                self.reboot_issued.store(false, Ordering::SeqCst);
                *self.pending.lock() = Some(PendingReboot { job: job.clone(), due });
                info!(
                    "client: job={} awaiting reboot in {:?}",
                    job.id, self.config.reboot_delay
                );
                Ok(CheckOutcome::Scheduled(job))
            }
            Err(reason) => {
                job.fail(reason);
                self.archive(job.clone());
                Ok(CheckOutcome::Failed(job))
            }
        }
    }

    fn run_job(&self, job: &mut UpdateJob, download: &Path) -> Result<(), String> {
        job.advance(JobState::Downloading);
        fs::create_dir_all(&self.config.work_dir)
            .map_err(|err| format!("work dir {}: {err}", self.config.work_dir.display()))?;
        self.source
            .fetch(&job.candidate, download)
            .map_err(|err| format!("download: {err}"))?;

        job.advance(JobState::Verifying);
        let bundle = verify_bundle(download, &self.policy)
            .map_err(|err| format!("verification ({}): {err}", err.kind()))?;
        if bundle.version() != job.candidate.version {
            return Err(format!(
                "bundle version {} does not match advertised {}",
                bundle.version(),
                job.candidate.version
            ));
        }

        job.advance(JobState::Installing);
        let device = self.manager.status().record(job.target).device.clone();
        let hook = self.hook_path(job);
        let has_hook = bundle
            .extract_hook(&hook)
            .and_then(|present| {
                if present {
                    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))?;
                }
                Ok(present)
            })
            .map_err(|err| format!("hook extraction: {err}"))?;
        if has_hook {
            run_hook(&hook, "pre-install", job.target, &device)?;
        }

        let cancel = CancelToken::new();
        *self.install_cancel.lock() = Some(cancel.clone());
        self.install(job, &bundle, &cancel)?;

        if has_hook {
            run_hook(&hook, "post-install", job.target, &device)?;
        }
        self.manager
            .activate(job.target)
            .map_err(|err| format!("activate ({}): {err}", err.kind()))?;
        Ok(())
    }

    fn install(&self, job: &UpdateJob, bundle: &VerifiedBundle, cancel: &CancelToken) -> Result<(), String> {
        self.manager
            .install(job.target, bundle, cancel)
            .map_err(|err| format!("install ({}): {err}", err.kind()))
    }

    /// Cancels the install of the running job if it has not written yet.
    pub fn cancel_install(&self) -> bool {
        match self.install_cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Hands off to the rebooter once the scheduled delay has elapsed.
    pub fn reboot_if_due(&self) -> Result<bool, ClientError> {
        let pending = self.pending.lock();
        let Some(reboot) = pending.as_ref() else {
            return Ok(false);
        };
        if Instant::now() < reboot.due || self.reboot_issued.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.reboot_issued.store(true, Ordering::SeqCst);
        info!("client: job={} rebooting into slot={}", reboot.job.id, reboot.job.target);
        if let Err(err) = self.rebooter.reboot() {
            error!("client: job={} reboot failed: {}", reboot.job.id, err);
            self.reboot_issued.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }

    /// Withdraws a scheduled reboot and re-selects the previous slot.
    pub fn cancel_reboot(&self) -> Result<UpdateJob, ClientError> {
        let mut pending = self.pending.lock();
        if self.reboot_issued.load(Ordering::SeqCst) {
            return Err(ClientError::RebootIssued);
        }
        let Some(reboot) = pending.take() else {
            return Err(ClientError::NoPendingReboot);
        };
        let mut job = reboot.job;
        if let Err(err) = self.manager.activate(job.previous) {
            *pending = Some(PendingReboot { job, due: reboot.due });
            return Err(err.into());
        }
        job.fail("reboot cancelled");
        remove_quietly(&self.config.journal_path);
        self.archive(job.clone());
        Ok(job)
    }

    /// Finishes the journaled job after a reboot, once the verdict is known.
    pub fn resume_after_boot(&self) -> Result<Option<UpdateJob>, ClientError> {
        let Some(mut job) = self.read_journal()? else {
            return Ok(None);
        };
        job.advance(JobState::Confirming);

        let status = self.manager.status();
        let record = status.record(job.target);
        match record.state {
            SlotState::Booted if status.active == job.target => {
                info!("client: job={} waiting for health verdict on slot={}", job.id, job.target);
                self.write_journal(&job).map_err(|err| ClientError::Journal(err.to_string()))?;
                return Ok(Some(job));
            }
            SlotState::Good if status.active == job.target => {
                job.advance(JobState::Completed);
                info!("client: job={} completed, slot={} good", job.id, job.target);
            }
            state => {
                job.fail(format!(
                    "slot {} is {state} after reboot, boot-selected is {}",
                    job.target, status.active
                ));
            }
        }
        remove_quietly(&self.config.journal_path);
        self.archive(job.clone());
        Ok(Some(job))
    }

    /// Job currently awaiting reboot, if any.
    pub fn pending_job(&self) -> Option<UpdateJob> {
        self.pending.lock().as_ref().map(|reboot| reboot.job.clone())
    }

    /// Finished jobs, oldest first.
    pub fn history(&self) -> Vec<UpdateJob> {
        self.history.lock().iter().cloned().collect()
    }

    fn archive(&self, job: UpdateJob) {
        let mut history = self.history.lock();
        history.push_back(job);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    fn next_job_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("job-{}-{}", unix_ms(), seq)
    }

    fn hook_path(&self, job: &UpdateJob) -> PathBuf {
        self.config.work_dir.join(format!("{}.hook", job.id))
    }

    fn write_journal(&self, job: &UpdateJob) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(job).map_err(io::Error::other)?;
        write_atomic(&self.config.journal_path, &bytes)
    }

    fn read_journal(&self) -> Result<Option<UpdateJob>, ClientError> {
        let bytes = match fs::read(&self.config.journal_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ClientError::Journal(err.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| ClientError::Journal(format!("corrupt journal: {err}")))
    }
}

/// Whether `candidate` supersedes `installed`.
///
/// Semantic versions compare by precedence; anything else counts as newer
/// whenever it differs.
pub fn is_newer(candidate: &str, installed: Option<&str>) -> bool {
    let Some(installed) = installed else {
        return true;
    };
    match (Version::parse(candidate), Version::parse(installed)) {
        (Ok(candidate), Ok(installed)) => candidate > installed,
        _ => candidate != installed,
    }
}

fn run_hook(hook: &Path, phase: &str, slot: Slot, device: &str) -> Result<(), String> {
    info!("client: running {} hook for slot={}", phase, slot);
    let output = Command::new(hook)
        .arg(phase)
        .arg(slot.as_str())
        .arg(device)
        .output()
        .map_err(|err| format!("{phase} hook: {err}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{phase} hook exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("client: failed to remove {}: {}", path.display(), err);
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
