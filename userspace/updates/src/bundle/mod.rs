// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Update bundle container format (tar archive + TOML manifest)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests per submodule + tests/updates_host
//!
//! Archive layout, in order:
//!   1. `manifest.toml`  (signed bytes)
//!   2. `manifest.sig`   (optional, raw 64-byte Ed25519 signature)
//!   3. one entry per declared image
//!   4. the hook script, if declared

pub mod builder;
pub mod format;
pub mod manifest;
pub mod verify;

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

pub use builder::{build_bundle, BuildError, BuildOptions, Bundle, BundleBuilder};
pub use format::{Ext4Formatter, FormatError, ImageFormatter, TarImageFormatter};
pub use manifest::{HookEntry, ImageEntry, Manifest, ManifestError};
pub use verify::{
    verify_bundle, verify_bundle_with, Ed25519Verifier, SignatureFailure, SignatureVerifier,
    VerifiedBundle, VerifyError, VerifyPolicy,
};

/// SHA-256 digest bytes.
pub type Sha256Digest = [u8; 32];

/// Archive entry holding the manifest.
pub const MANIFEST_ENTRY: &str = "manifest.toml";
/// Archive entry holding the detached manifest signature.
pub const SIGNATURE_ENTRY: &str = "manifest.sig";
/// File extension used for bundle archives.
pub const BUNDLE_EXTENSION: &str = "bundle";
/// Upper bound for manifest bytes.
pub const MAX_MANIFEST_BYTES: u64 = 256 * 1024;
/// Length of a raw Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

const HASH_CHUNK: usize = 64 * 1024;

pub(crate) fn is_reserved_entry(name: &str) -> bool {
    name == MANIFEST_ENTRY || name == SIGNATURE_ENTRY
}

pub(crate) fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\0') {
        return false;
    }
    for part in path.split('/') {
        if part == ".." {
            return false;
        }
    }
    true
}

/// Hashes `bytes` in one go.
pub fn sha256(bytes: &[u8]) -> Sha256Digest {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Streams `reader` to the end, returning its SHA-256 and length.
pub(crate) fn hash_stream(reader: &mut dyn Read) -> io::Result<(Sha256Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok((out, total))
}

/// Hashes a file on disk.
pub fn sha256_file(path: &Path) -> io::Result<(Sha256Digest, u64)> {
    let mut file = File::open(path)?;
    hash_stream(&mut file)
}

/// Reads the manifest of a bundle without verifying anything else.
///
/// Used by bundle sources to learn `(compatible, version)` cheaply; the
/// result must never be trusted for installation.
pub fn read_manifest(path: &Path) -> Result<Manifest, VerifyError> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(file);
    let mut entries = archive
        .entries()
        .map_err(|err| VerifyError::MalformedManifest(format!("archive: {err}")))?;
    let entry = entries
        .next()
        .ok_or_else(|| VerifyError::MalformedManifest("empty archive".into()))?
        .map_err(|err| VerifyError::MalformedManifest(format!("archive entry: {err}")))?;
    let bytes = verify::read_manifest_entry(entry)?;
    let (manifest, _) =
        Manifest::parse(&bytes).map_err(|err| VerifyError::MalformedManifest(err.to_string()))?;
    Ok(manifest)
}
