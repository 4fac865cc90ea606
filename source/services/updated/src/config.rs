// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration file (`updated.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use updates::health::{
    CommandCheck, DiskUsageCheck, FileCheck, HealthCheck, ProcessCheck, TcpCheck,
};
use updates::{FailureAction, Slot};

/// Errors produced while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Values are inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root of `updated.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Compatibility id of this device.
    pub compatible: String,
    /// Version recorded for the factory image on first start.
    #[serde(default = "default_factory_version")]
    pub factory_version: String,
    /// Directory holding the slot table, job journal and work files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Boot selector backend.
    #[serde(default)]
    pub boot: BootConfig,
    /// Slot devices.
    pub slots: SlotsConfig,
    /// Bundle verification policy.
    #[serde(default)]
    pub verify: VerifyConfig,
    /// Update client.
    #[serde(default)]
    pub client: ClientSection,
    /// Health monitor.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Boot selector backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    /// `key=value` file.
    #[default]
    EnvFile,
    /// U-Boot environment via `fw_printenv` / `fw_setenv`.
    Uboot,
}

/// `[boot]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BootConfig {
    /// Backend.
    pub selector: SelectorKind,
    /// Environment file for the `env-file` backend.
    pub env_file: PathBuf,
    /// Variable holding the selected slot.
    pub variable: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            selector: SelectorKind::EnvFile,
            env_file: PathBuf::from("/boot/bootenv"),
            variable: "boot_slot".into(),
        }
    }
}

/// `[slots]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotsConfig {
    /// Devices for slot-0 and slot-1.
    pub devices: [String; 2],
    /// Boot attempts before rollback.
    #[serde(default = "default_attempts")]
    pub boot_attempts_limit: u32,
    /// Slot the system runs from; the boot-selected slot when unset.
    #[serde(default)]
    pub running_slot: Option<String>,
}

/// `[verify]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VerifyConfig {
    /// Reject unsigned bundles.
    pub require_signature: bool,
    /// Directory of `*.pub` trust anchors.
    pub anchors_dir: Option<PathBuf>,
}

/// `[client]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientSection {
    /// Directory scanned for `*.bundle` files.
    pub source_dir: PathBuf,
    /// Download and hook scratch directory; `<state_dir>/work` when unset.
    pub work_dir: Option<PathBuf>,
    /// Seconds between polls.
    pub poll_interval_secs: u64,
    /// Random extra delay added to each poll, seconds.
    pub poll_jitter_secs: u64,
    /// Seconds between activation and reboot.
    pub reboot_delay_secs: u64,
    /// Command that reboots the device.
    pub reboot_command: Vec<String>,
    /// Finished jobs kept in memory.
    pub history_limit: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("/run/media/updates"),
            work_dir: None,
            poll_interval_secs: 3600,
            poll_jitter_secs: 300,
            reboot_delay_secs: 10,
            reboot_command: vec!["reboot".into()],
            history_limit: 16,
        }
    }
}

/// `[health]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
    /// Evaluation window, seconds.
    pub timeout_secs: u64,
    /// What to do on failure.
    pub failure_action: FailureAction,
    /// Checks to run.
    pub checks: Vec<CheckConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { timeout_secs: 60, failure_action: FailureAction::Rollback, checks: Vec::new() }
    }
}

/// One `[[health.checks]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum CheckConfig {
    /// Command must exit 0.
    Command {
        /// Check name.
        name: String,
        /// Program to run.
        program: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
    },
    /// Process must be running.
    Process {
        /// Check name.
        name: String,
        /// Exact process name.
        process: String,
    },
    /// TCP endpoint must accept connections.
    Tcp {
        /// Check name.
        name: String,
        /// `host:port`.
        address: String,
        /// Connect timeout, milliseconds.
        #[serde(default = "default_tcp_timeout")]
        timeout_ms: u64,
    },
    /// Mount must stay below a used-space ceiling.
    Disk {
        /// Check name.
        name: String,
        /// Mount point.
        mount_point: PathBuf,
        /// Ceiling in percent.
        max_used_percent: f64,
    },
    /// Path must exist.
    File {
        /// Check name.
        name: String,
        /// Path.
        path: PathBuf,
    },
}

impl CheckConfig {
    /// Builds the runtime check.
    pub fn build(&self) -> Box<dyn HealthCheck> {
        match self {
            CheckConfig::Command { name, program, args } => {
                Box::new(CommandCheck::new(name.clone(), program.clone(), args.clone()))
            }
            CheckConfig::Process { name, process } => {
                Box::new(ProcessCheck::new(name.clone(), process.clone()))
            }
            CheckConfig::Tcp { name, address, timeout_ms } => Box::new(TcpCheck::new(
                name.clone(),
                address.clone(),
                Duration::from_millis(*timeout_ms),
            )),
            CheckConfig::Disk { name, mount_point, max_used_percent } => Box::new(
                DiskUsageCheck::new(name.clone(), mount_point.clone(), *max_used_percent),
            ),
            CheckConfig::File { name, path } => Box::new(FileCheck::new(name.clone(), path.clone())),
        }
    }

    fn name(&self) -> &str {
        match self {
            CheckConfig::Command { name, .. }
            | CheckConfig::Process { name, .. }
            | CheckConfig::Tcp { name, .. }
            | CheckConfig::Disk { name, .. }
            | CheckConfig::File { name, .. } => name,
        }
    }
}

impl Config {
    /// Reads and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&text)
    }

    /// Parses and validates TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("compatible", &self.compatible), ("factory_version", &self.factory_version)] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(invalid(format!("`{field}` must be a non-empty token")));
            }
        }
        if self.slots.devices.iter().any(String::is_empty) {
            return Err(invalid("slot devices must not be empty"));
        }
        if self.slots.devices[0] == self.slots.devices[1] {
            return Err(invalid("both slots point at the same device"));
        }
        if self.slots.boot_attempts_limit == 0 {
            return Err(invalid("`slots.boot_attempts_limit` must be at least 1"));
        }
        self.running_slot()?;
        if self.verify.require_signature && self.verify.anchors_dir.is_none() {
            return Err(invalid("`verify.require_signature` needs `verify.anchors_dir`"));
        }
        if self.client.poll_interval_secs == 0 {
            return Err(invalid("`client.poll_interval_secs` must be at least 1"));
        }
        if self.client.reboot_command.is_empty() {
            return Err(invalid("`client.reboot_command` must not be empty"));
        }
        if self.health.timeout_secs == 0 {
            return Err(invalid("`health.timeout_secs` must be at least 1"));
        }
        if self.boot.variable.is_empty() {
            return Err(invalid("`boot.variable` must not be empty"));
        }
        let mut names = Vec::new();
        for check in &self.health.checks {
            if names.contains(&check.name()) {
                return Err(invalid(format!("duplicate health check `{}`", check.name())));
            }
            names.push(check.name());
            if let CheckConfig::Disk { max_used_percent, .. } = check {
                if !(0.0..=100.0).contains(max_used_percent) {
                    return Err(invalid(format!("check `{}`: percent out of range", check.name())));
                }
            }
        }
        Ok(())
    }

    /// Configured running slot, if pinned.
    pub fn running_slot(&self) -> Result<Option<Slot>, ConfigError> {
        self.slots
            .running_slot
            .as_deref()
            .map(|value| value.parse::<Slot>().map_err(invalid))
            .transpose()
    }

    /// Slot table JSON.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("slots.json")
    }

    /// Journal of the job awaiting reboot.
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("job.json")
    }

    /// Download and hook scratch directory.
    pub fn work_dir(&self) -> PathBuf {
        self.client.work_dir.clone().unwrap_or_else(|| self.state_dir.join("work"))
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}

fn default_factory_version() -> String {
    "0.0.0".into()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/updated")
}

fn default_attempts() -> u32 {
    3
}

fn default_tcp_timeout() -> u64 {
    2000
}
