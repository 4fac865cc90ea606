// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated daemon – boot supervision, health evaluation and A/B update polling
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests (config parsing, local install + boot supervision)
//!
//! PUBLIC API: Config, Daemon, BootReport
//! DEPENDS_ON: updates domain library

#![forbid(unsafe_code)]

pub mod config;
mod std_server;

pub use config::{Config, ConfigError};
pub use std_server::*;
