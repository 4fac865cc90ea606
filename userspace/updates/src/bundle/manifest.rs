// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bundle manifest model and its TOML encoding.
//!
//! The manifest is the only part of a bundle covered by the detached
//! signature, so the bytes produced by [`Manifest::to_bytes`] are exactly the
//! bytes that get signed and later re-parsed by the verifier. Parsing walks
//! the TOML table by hand so every field gets a precise error.

use std::collections::BTreeMap;

use thiserror::Error;
use toml::{Table, Value};

use super::{is_reserved_entry, Sha256Digest};

const KNOWN_KEYS: &[&str] = &["compatible", "version", "build_timestamp", "hooks", "image"];

/// Result alias returned by the manifest parser.
pub type Result<T> = core::result::Result<T, ManifestError>;

/// Errors emitted while parsing or validating manifests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// The manifest is not valid UTF-8 TOML.
    #[error("manifest parse error: {0}")]
    Toml(String),
    /// The root element is not a TOML table.
    #[error("manifest root must be a TOML table")]
    InvalidRoot,
    /// A required field was not provided.
    #[error("missing required field `{0}`")]
    MissingField(String),
    /// A field contained a malformed value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Dotted path of the offending field.
        field: String,
        /// Human-readable reason for the failure.
        reason: String,
    },
}

/// One content image declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Image class (`image.<name>` section), e.g. `rootfs`.
    pub name: String,
    /// Archive entry holding the image bytes.
    pub filename: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared SHA-256 of the image bytes.
    pub sha256: Sha256Digest,
}

/// Optional lifecycle hook script shipped with the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEntry {
    /// Archive entry holding the hook script.
    pub filename: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared SHA-256 of the script.
    pub sha256: Sha256Digest,
}

/// Parsed bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Target compatibility identifier.
    pub compatible: String,
    /// Semantic-version-like bundle version.
    pub version: String,
    /// Build time in seconds since the Unix epoch.
    pub build_timestamp: u64,
    /// Images keyed by class name.
    pub images: BTreeMap<String, ImageEntry>,
    /// Hook script, if any.
    pub hook: Option<HookEntry>,
}

impl Manifest {
    /// Looks up an image by class name.
    pub fn image(&self, name: &str) -> Option<&ImageEntry> {
        self.images.get(name)
    }

    /// Returns every archive entry name the manifest declares.
    pub fn declared_entries(&self) -> impl Iterator<Item = &str> {
        self.images
            .values()
            .map(|image| image.filename.as_str())
            .chain(self.hook.iter().map(|hook| hook.filename.as_str()))
    }

    /// Encodes the manifest as canonical TOML bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut root = Table::new();
        root.insert("compatible".into(), Value::String(self.compatible.clone()));
        root.insert("version".into(), Value::String(self.version.clone()));
        root.insert("build_timestamp".into(), Value::Integer(self.build_timestamp as i64));

        if let Some(hook) = &self.hook {
            root.insert(
                "hooks".into(),
                Value::Table(entry_table(&hook.filename, hook.size, &hook.sha256)),
            );
        }

        let mut images = Table::new();
        for image in self.images.values() {
            images.insert(
                image.name.clone(),
                Value::Table(entry_table(&image.filename, image.size, &image.sha256)),
            );
        }
        root.insert("image".into(), Value::Table(images));

        // Serializing a plain table cannot fail.
        toml::to_string(&root).unwrap_or_default().into_bytes()
    }

    /// Parses manifest bytes. Returns the manifest plus non-fatal warnings.
    pub fn parse(bytes: &[u8]) -> Result<(Self, Vec<String>)> {
        let text = core::str::from_utf8(bytes)
            .map_err(|err| ManifestError::Toml(format!("invalid utf-8: {err}")))?;
        let value: Value = toml::from_str(text).map_err(|err| ManifestError::Toml(err.to_string()))?;
        let table = value.as_table().ok_or(ManifestError::InvalidRoot)?;

        let mut warnings = Vec::new();
        for key in table.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warnings.push(format!("unknown key `{key}`"));
            }
        }

        let compatible = require_token(table, "compatible", "compatible")?;
        let version = require_token(table, "version", "version")?;
        let build_timestamp = match table.get("build_timestamp") {
            None => 0,
            Some(value) => require_u64(value, "build_timestamp")?,
        };

        let images_raw = table
            .get("image")
            .ok_or_else(|| ManifestError::MissingField("image".into()))?
            .as_table()
            .ok_or_else(|| invalid("image", "expected a table of image sections"))?;
        if images_raw.is_empty() {
            return Err(invalid("image", "must declare at least one image"));
        }

        let mut images = BTreeMap::new();
        for (name, section) in images_raw {
            let field = format!("image.{name}");
            if !is_valid_name(name) {
                return Err(invalid(&field, "image names use [A-Za-z0-9._-]"));
            }
            let section =
                section.as_table().ok_or_else(|| invalid(&field, "expected a table"))?;
            let (filename, size, sha256) = parse_entry(section, &field)?;
            images.insert(
                name.clone(),
                ImageEntry { name: name.clone(), filename, size, sha256 },
            );
        }

        let hook = match table.get("hooks") {
            None => None,
            Some(section) => {
                let section =
                    section.as_table().ok_or_else(|| invalid("hooks", "expected a table"))?;
                let (filename, size, sha256) = parse_entry(section, "hooks")?;
                Some(HookEntry { filename, size, sha256 })
            }
        };

        let manifest = Self { compatible, version, build_timestamp, images, hook };
        manifest.check_unique_entries()?;
        Ok((manifest, warnings))
    }

    fn check_unique_entries(&self) -> Result<()> {
        let mut seen = Vec::new();
        for name in self.declared_entries() {
            if seen.contains(&name) {
                return Err(invalid("filename", &format!("`{name}` declared twice")));
            }
            seen.push(name);
        }
        Ok(())
    }
}

fn entry_table(filename: &str, size: u64, sha256: &Sha256Digest) -> Table {
    let mut table = Table::new();
    table.insert("filename".into(), Value::String(filename.to_string()));
    table.insert("size".into(), Value::Integer(size as i64));
    table.insert("sha256".into(), Value::String(hex::encode(sha256)));
    table
}

fn parse_entry(section: &Table, prefix: &str) -> Result<(String, u64, Sha256Digest)> {
    let filename_field = format!("{prefix}.filename");
    let filename = require_token(section, "filename", &filename_field)?;
    if !is_valid_name(&filename) || is_reserved_entry(&filename) {
        return Err(invalid(&filename_field, "must be a plain, non-reserved file name"));
    }

    let size_field = format!("{prefix}.size");
    let size = require_u64(
        section.get("size").ok_or_else(|| ManifestError::MissingField(size_field.clone()))?,
        &size_field,
    )?;

    let sha_field = format!("{prefix}.sha256");
    let sha_hex = require_token(section, "sha256", &sha_field)?;
    let sha_bytes =
        hex::decode(&sha_hex).map_err(|err| invalid(&sha_field, &format!("bad hex: {err}")))?;
    let sha256: Sha256Digest =
        sha_bytes.try_into().map_err(|_| invalid(&sha_field, "expected 32 bytes"))?;

    Ok((filename, size, sha256))
}

fn require_token(table: &Table, key: &str, field: &str) -> Result<String> {
    match table.get(key) {
        Some(Value::String(value)) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
            if trimmed.chars().any(char::is_whitespace) {
                return Err(invalid(field, "must not contain whitespace"));
            }
            Ok(trimmed.to_string())
        }
        Some(_) => Err(invalid(field, "expected string")),
        None => Err(ManifestError::MissingField(field.to_string())),
    }
}

fn require_u64(value: &Value, field: &str) -> Result<u64> {
    let raw = value.as_integer().ok_or_else(|| invalid(field, "expected integer"))?;
    u64::try_from(raw).map_err(|_| invalid(field, "must be >= 0"))
}

fn invalid(field: &str, reason: &str) -> ManifestError {
    ManifestError::InvalidField { field: field.to_string(), reason: reason.to_string() }
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}
