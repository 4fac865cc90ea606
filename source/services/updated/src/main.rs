// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated daemon entrypoint and operator commands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use updated::{Config, Daemon};
use updates::CheckOutcome;

/// A/B update daemon.
#[derive(Debug, Parser)]
#[command(name = "updated", version, about = "A/B update daemon", long_about = None)]
struct Cli {
    /// Daemon configuration file.
    #[arg(long, global = true, value_name = "FILE", default_value = "/etc/updated/updated.toml")]
    config: PathBuf,

    /// Maximum log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Supervise this boot, then poll for updates until terminated.
    Run,
    /// Supervise this boot once and exit.
    Boot,
    /// Poll the update source once.
    Check,
    /// Print slot status as JSON.
    Status,
    /// Install a local bundle into the inactive slot and select it.
    Install {
        /// Bundle file.
        bundle: PathBuf,
    },
    /// Mark the running slot good.
    Confirm,
    /// Select the other known-good slot for the next boot.
    Rollback,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let config = Config::load(&cli.config)?;
    let daemon = Daemon::open(&config)?;

    match cli.command {
        Command::Run => daemon.run()?,
        Command::Boot => {
            let report = daemon.supervise_boot()?;
            println!("running slot: {}", report.running);
            if let Some(attempt) = report.attempt {
                println!("boot attempt: {attempt:?}");
            }
            if let Some(run) = &report.health {
                println!("health: {:?}", run.verdict);
            }
            if let Some(job) = &report.job {
                println!("job {}: {:?}", job.id, job.state);
            }
            if report.reboot_required {
                daemon.reboot();
            }
        }
        Command::Check => match daemon.check()? {
            CheckOutcome::Scheduled(job) => {
                println!("installed {} into {}", job.candidate.version, job.target);
                // one-shot: no poll loop to honor the reboot delay
                daemon.reboot();
            }
            CheckOutcome::Failed(job) => {
                return Err(format!(
                    "update {} failed: {}",
                    job.candidate.version,
                    job.failure.unwrap_or_default()
                )
                .into());
            }
            other => println!("{other:?}"),
        },
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&*daemon.status())?);
        }
        Command::Install { bundle } => {
            let slot = daemon.install(&bundle)?;
            println!("installed into {slot}; reboot to apply");
        }
        Command::Confirm => {
            let slot = daemon.confirm()?;
            println!("{slot} confirmed");
        }
        Command::Rollback => {
            let slot = daemon.rollback()?;
            println!("{slot} selected for next boot");
        }
    }
    Ok(())
}
