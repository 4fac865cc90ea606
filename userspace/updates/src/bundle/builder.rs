// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bundle builder (rootfs tree -> signed, self-verified bundle)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests below + tests/updates_host/tests/ota_flow.rs
//!
//! The build runs in a private work directory next to the output so the final
//! rename stays on one filesystem. A bundle is only left on disk once it has
//! passed the same verification the device will run.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signer, SigningKey};
use log::{debug, info, warn};
use tar::{Builder as TarBuilder, EntryType, Header};
use thiserror::Error;
use walkdir::WalkDir;

use super::format::{Ext4Formatter, FormatError, ImageFormatter};
use super::manifest::{is_valid_name, HookEntry, ImageEntry, Manifest};
use super::verify::{verify_bundle, VerifyError, VerifyPolicy};
use super::{is_reserved_entry, sha256_file, MANIFEST_ENTRY, SIGNATURE_ENTRY};
use crate::keys;

const BLOCK: u64 = 4096;
const ENOSPC: i32 = 28;

/// Errors produced while building a bundle.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Rootfs, version, compatibility id or hook were rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Image or archive does not fit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Signing key missing or malformed.
    #[error("signing failed: {0}")]
    Signing(String),
    /// Image formatter failed.
    #[error("image format failed: {0}")]
    Format(FormatError),
    /// The freshly written bundle failed verification.
    #[error("self-verification failed: {0}")]
    SelfVerify(#[source] VerifyError),
    /// I/O failure.
    #[error("io error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            Self::ResourceExhausted(err.to_string())
        } else {
            Self::Io(err)
        }
    }
}

impl From<FormatError> for BuildError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::CapacityExceeded { capacity } => {
                Self::ResourceExhausted(format!("tree does not fit in {capacity} byte image"))
            }
            FormatError::Io(err) => Self::from(err),
            other => Self::Format(other),
        }
    }
}

/// Sizing and naming knobs for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Image class recorded in the manifest (`image.<name>`).
    pub image_name: String,
    /// Extra headroom on top of the measured tree size.
    pub slack_percent: u32,
    /// Lower bound for the work image.
    pub min_image_size: u64,
    /// Upper bound for the work image, if any.
    pub max_image_size: Option<u64>,
    /// Fixed build timestamp; the current time when unset.
    pub build_timestamp: Option<u64>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            image_name: "rootfs".into(),
            slack_percent: 10,
            min_image_size: 512 * 1024 * 1024,
            max_image_size: None,
            build_timestamp: None,
        }
    }
}

/// Where the signing key comes from.
#[derive(Debug, Clone)]
pub enum SigningSource {
    /// Key already in memory.
    Key(SigningKey),
    /// Hex encoded seed on disk.
    File(PathBuf),
}

/// A bundle written and verified by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Output path.
    pub path: PathBuf,
    /// Manifest embedded in the bundle.
    pub manifest: Manifest,
    /// Whether the manifest carries a signature.
    pub signed: bool,
}

/// Builder turning a rootfs tree into a bundle.
pub struct BundleBuilder {
    rootfs: PathBuf,
    version: String,
    compatible: String,
    signing: Option<SigningSource>,
    hook: Option<PathBuf>,
    options: BuildOptions,
    formatter: Box<dyn ImageFormatter>,
}

impl BundleBuilder {
    /// Starts a build of `rootfs` with the ext4 formatter and default options.
    pub fn new(
        rootfs: impl Into<PathBuf>,
        version: impl Into<String>,
        compatible: impl Into<String>,
    ) -> Self {
        Self {
            rootfs: rootfs.into(),
            version: version.into(),
            compatible: compatible.into(),
            signing: None,
            hook: None,
            options: BuildOptions::default(),
            formatter: Box::new(Ext4Formatter::default()),
        }
    }

    /// Signs the manifest with `key`.
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing = Some(SigningSource::Key(key));
        self
    }

    /// Signs the manifest with the seed stored at `path`.
    pub fn signing_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.signing = Some(SigningSource::File(path.into()));
        self
    }

    /// Ships `script` as the bundle's install hook.
    pub fn hook(mut self, script: impl Into<PathBuf>) -> Self {
        self.hook = Some(script.into());
        self
    }

    /// Replaces the build options.
    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the image formatter.
    pub fn formatter(mut self, formatter: impl ImageFormatter + 'static) -> Self {
        self.formatter = Box::new(formatter);
        self
    }

    /// Runs the build and writes the bundle to `output`.
    pub fn build(&self, output: &Path) -> Result<Bundle, BuildError> {
        check_token("version", &self.version)?;
        check_token("compatible", &self.compatible)?;
        if !is_valid_name(&self.options.image_name) {
            return Err(BuildError::InvalidInput(format!(
                "image name `{}` must use [A-Za-z0-9._-]",
                self.options.image_name
            )));
        }
        let image_filename = format!("{}.img", self.options.image_name);
        let hook = self.hook.as_deref().map(|path| hook_source(path, &image_filename)).transpose()?;
        let signing_key = self.resolve_signing_key()?;

        let used = measure_tree(&self.rootfs)?;
        let capacity = image_capacity(used, &self.options)?;
        debug!(
            "bundle: rootfs {} uses {} bytes, image capacity {} ({})",
            self.rootfs.display(),
            used,
            capacity,
            self.formatter.name()
        );

        let parent = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let work = tempfile::Builder::new().prefix(".bundle-build").tempdir_in(parent)?;
        let image_path = work.path().join(&image_filename);
        File::create(&image_path)?.set_len(capacity)?;

        self.formatter.format(&self.rootfs, &image_path, capacity)?;
        let shrunk = self.formatter.shrink(&image_path)?;
        let (image_sha, image_size) = sha256_file(&image_path)?;
        if image_size != shrunk {
            warn!("bundle: formatter reported {shrunk} bytes, image holds {image_size}");
        }

        let mut manifest = Manifest {
            compatible: self.compatible.clone(),
            version: self.version.clone(),
            build_timestamp: self.options.build_timestamp.unwrap_or_else(unix_now),
            images: Default::default(),
            hook: None,
        };
        manifest.images.insert(
            self.options.image_name.clone(),
            ImageEntry {
                name: self.options.image_name.clone(),
                filename: image_filename.clone(),
                size: image_size,
                sha256: image_sha,
            },
        );
        if let Some((filename, path)) = &hook {
            let (sha, size) = sha256_file(path)?;
            manifest.hook = Some(HookEntry { filename: filename.clone(), size, sha256: sha });
        }

        let manifest_bytes = manifest.to_bytes();
        let signature = signing_key.as_ref().map(|key| key.sign(&manifest_bytes).to_bytes());

        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut tar = TarBuilder::new(staged.as_file_mut());
            append_entry(&mut tar, MANIFEST_ENTRY, 0o644, manifest_bytes.len() as u64, &manifest_bytes[..])?;
            if let Some(sig) = &signature {
                append_entry(&mut tar, SIGNATURE_ENTRY, 0o644, sig.len() as u64, &sig[..])?;
            }
            append_entry(&mut tar, &image_filename, 0o644, image_size, File::open(&image_path)?)?;
            if let Some((filename, path)) = &hook {
                let file = File::open(path)?;
                let size = file.metadata()?.len();
                append_entry(&mut tar, filename, 0o755, size, file)?;
            }
            tar.finish()?;
        }
        staged.as_file_mut().flush()?;
        staged.as_file().sync_all()?;
        staged.persist(output).map_err(|err| BuildError::from(err.error))?;

        let policy = match &signing_key {
            Some(key) => VerifyPolicy::signed(self.compatible.clone(), vec![key.verifying_key()]),
            None => VerifyPolicy::unsigned(self.compatible.clone()),
        };
        if let Err(err) = verify_bundle(output, &policy) {
            warn!("bundle: self-verification of {} failed: {}", output.display(), err);
            let _ = fs::remove_file(output);
            return Err(BuildError::SelfVerify(err));
        }

        info!(
            "bundle: built {} version={} compatible={} signed={}",
            output.display(),
            manifest.version,
            manifest.compatible,
            signature.is_some()
        );
        Ok(Bundle { path: output.to_path_buf(), manifest, signed: signature.is_some() })
    }

    fn resolve_signing_key(&self) -> Result<Option<SigningKey>, BuildError> {
        match &self.signing {
            None => Ok(None),
            Some(SigningSource::Key(key)) => Ok(Some(key.clone())),
            Some(SigningSource::File(path)) => keys::load_signing_key(path)
                .map(Some)
                .map_err(|err| BuildError::Signing(format!("{}: {err}", path.display()))),
        }
    }
}

/// Builds `rootfs` into `output` with default options and the ext4 formatter.
pub fn build_bundle(
    rootfs: &Path,
    version: &str,
    compatible: &str,
    signing_key: Option<&SigningKey>,
    output: &Path,
) -> Result<Bundle, BuildError> {
    let mut builder = BundleBuilder::new(rootfs, version, compatible);
    if let Some(key) = signing_key {
        builder = builder.signing_key(key.clone());
    }
    builder.build(output)
}

/// Measures the space `rootfs` occupies in 4 KiB blocks.
pub fn measure_tree(rootfs: &Path) -> Result<u64, BuildError> {
    let meta = fs::metadata(rootfs).map_err(|err| {
        BuildError::InvalidInput(format!("rootfs {}: {err}", rootfs.display()))
    })?;
    if !meta.is_dir() {
        return Err(BuildError::InvalidInput(format!("rootfs {} is not a directory", rootfs.display())));
    }

    let mut used = 0u64;
    let mut entries = 0usize;
    for entry in WalkDir::new(rootfs).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| {
            BuildError::InvalidInput(format!("walking {}: {err}", rootfs.display()))
        })?;
        entries += 1;
        let meta = entry.path().symlink_metadata()?;
        used += if meta.is_file() { meta.len().div_ceil(BLOCK) * BLOCK } else { BLOCK };
    }

    if entries == 0 || used == 0 {
        return Err(BuildError::InvalidInput(format!("rootfs {} is empty", rootfs.display())));
    }
    Ok(used)
}

/// Sizes the work image for `used` bytes of content.
pub fn image_capacity(used: u64, options: &BuildOptions) -> Result<u64, BuildError> {
    let scaled = (u128::from(used) * (100 + u128::from(options.slack_percent))).div_ceil(100);
    let capacity = u64::try_from(scaled)
        .map_err(|_| BuildError::ResourceExhausted(format!("{used} bytes cannot be imaged")))?
        .max(options.min_image_size);
    if let Some(max) = options.max_image_size {
        if capacity > max {
            return Err(BuildError::ResourceExhausted(format!(
                "image needs {capacity} bytes, limit is {max}"
            )));
        }
    }
    Ok(capacity)
}

fn check_token(field: &str, value: &str) -> Result<(), BuildError> {
    if value.is_empty() {
        return Err(BuildError::InvalidInput(format!("{field} must not be empty")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(BuildError::InvalidInput(format!("{field} must not contain whitespace")));
    }
    Ok(())
}

fn hook_source(path: &Path, image_filename: &str) -> Result<(String, PathBuf), BuildError> {
    if !path.is_file() {
        return Err(BuildError::InvalidInput(format!("hook {} is not a file", path.display())));
    }
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| is_valid_name(name) && !is_reserved_entry(name) && *name != image_filename)
        .ok_or_else(|| {
            BuildError::InvalidInput(format!("hook file name {} is not usable", path.display()))
        })?;
    Ok((filename.to_string(), path.to_path_buf()))
}

fn append_entry<W: Write, R: Read>(
    tar: &mut TarBuilder<W>,
    name: &str,
    mode: u32,
    size: u64,
    data: R,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    tar.append_data(&mut header, name, data)
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
