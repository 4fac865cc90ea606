// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Key material loading: trust anchors for verification and signing seeds for
//! the bundle builder.
//!
//! Anchors live in a directory of `*.pub` files, each either a hex encoded
//! 32-byte Ed25519 key or a PEM `PUBLIC KEY` (SPKI) block. Signing keys are a
//! hex encoded 32-byte seed.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;

pub use ed25519_dalek::VerifyingKey as PublicKey;

/// Errors produced while loading key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// I/O failure while reading key files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Provided key material was malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Loads anchor public keys from the provided directory, sorted by file name.
pub fn load_anchors(dir: &Path) -> Result<Vec<PublicKey>, KeyError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some("pub")
        {
            paths.push(path);
        }
    }

    paths.sort();

    let mut anchors = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = fs::read_to_string(&path)?;
        let key = parse_public_key(contents.trim()).map_err(|err| match err {
            KeyError::InvalidKey(reason) => {
                KeyError::InvalidKey(format!("{}: {reason}", path.display()))
            }
            other => other,
        })?;
        anchors.push(key);
    }

    Ok(anchors)
}

/// Parses a public key from hex or PEM text.
pub fn parse_public_key(input: &str) -> Result<PublicKey, KeyError> {
    if input.contains("-----BEGIN PUBLIC KEY-----") {
        let der = parse_pem_spki(input)?;
        return VerifyingKey::from_public_key_der(&der)
            .map_err(|err| KeyError::InvalidKey(err.to_string()));
    }
    let array = decode_hex_32(input, "Ed25519 public key")?;
    VerifyingKey::from_bytes(&array).map_err(|err| KeyError::InvalidKey(err.to_string()))
}

/// Loads a hex encoded Ed25519 signing seed.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyError> {
    let key_hex = fs::read_to_string(path)?;
    parse_signing_key(&key_hex)
}

/// Parses a hex encoded Ed25519 signing seed.
pub fn parse_signing_key(input: &str) -> Result<SigningKey, KeyError> {
    let seed = decode_hex_32(input, "ed25519 signing seed")?;
    Ok(SigningKey::from_bytes(&seed))
}

fn decode_hex_32(input: &str, what: &str) -> Result<[u8; 32], KeyError> {
    let filtered: String = input.chars().filter(|ch| !ch.is_ascii_whitespace()).collect();
    if filtered.is_empty() {
        return Err(KeyError::InvalidKey("empty key material".into()));
    }
    let bytes = hex::decode(&filtered)
        .map_err(|err| KeyError::InvalidKey(format!("failed to decode hex: {err}")))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidKey(format!("expected 32-byte {what}, got {len} bytes")))
}

fn parse_pem_spki(input: &str) -> Result<Vec<u8>, KeyError> {
    let begin = "-----BEGIN PUBLIC KEY-----";
    let end = "-----END PUBLIC KEY-----";
    let start = input
        .find(begin)
        .ok_or_else(|| KeyError::InvalidKey("missing PEM header".into()))?
        + begin.len();
    let stop = input.find(end).ok_or_else(|| KeyError::InvalidKey("missing PEM footer".into()))?;
    if stop <= start {
        return Err(KeyError::InvalidKey("invalid PEM framing".into()));
    }
    let cleaned: String = input[start..stop].chars().filter(|ch| !ch.is_whitespace()).collect();
    BASE64
        .decode(cleaned.as_bytes())
        .map_err(|err| KeyError::InvalidKey(format!("invalid PEM base64: {err}")))
}
