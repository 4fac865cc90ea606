// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Filesystem image formatters used by the bundle builder.
//!
//! A formatter receives a pre-allocated image file of `capacity` bytes, fills
//! it with the rootfs tree, and later shrinks it to the smallest consistent
//! size. The builder never looks inside the image.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, warn};
use tar::{Builder as TarBuilder, EntryType, Header};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors surfaced by image formatters.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Tree does not fit in the allocated image.
    #[error("image capacity exceeded ({capacity} bytes)")]
    CapacityExceeded {
        /// Allocated capacity.
        capacity: u64,
    },
    /// External tool failed.
    #[error("{tool} failed: {detail}")]
    Tool {
        /// Tool name.
        tool: String,
        /// Exit status and stderr.
        detail: String,
    },
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Capability that materializes a directory tree into an image blob.
pub trait ImageFormatter: Send + Sync {
    /// Short formatter name, recorded in logs.
    fn name(&self) -> &'static str;

    /// Fills `image` (already `capacity` bytes long) with `tree`.
    fn format(&self, tree: &Path, image: &Path, capacity: u64) -> Result<(), FormatError>;

    /// Shrinks `image` to its minimal consistent size and returns that size.
    fn shrink(&self, image: &Path) -> Result<u64, FormatError>;
}

/// Deterministic pure-Rust formatter that stores the tree as a tar stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarImageFormatter;

impl ImageFormatter for TarImageFormatter {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn format(&self, tree: &Path, image: &Path, capacity: u64) -> Result<(), FormatError> {
        let file = OpenOptions::new().write(true).open(image)?;
        let writer = BoundedWriter { inner: file, written: 0, capacity };
        let mut builder = TarBuilder::new(writer);

        let walker = WalkDir::new(tree).follow_links(false).sort_by_file_name().min_depth(1);
        for entry in walker {
            let entry = entry.map_err(|err| {
                FormatError::Io(err.into_io_error().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "directory walk failed")
                }))
            })?;
            let rel = entry.path().strip_prefix(tree).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "entry outside of tree")
            })?;
            let meta = entry.path().symlink_metadata()?;
            let mode = meta.permissions().mode() & 0o7777;
            let file_type = meta.file_type();

            let mut header = Header::new_gnu();
            header.set_mode(mode);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);

            let appended = if file_type.is_dir() {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, rel, io::empty())
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, rel, target)
            } else if file_type.is_file() {
                header.set_entry_type(EntryType::Regular);
                header.set_size(meta.len());
                builder.append_data(&mut header, rel, File::open(entry.path())?)
            } else {
                warn!("tar image: skipping special file {}", rel.display());
                continue;
            };
            appended.map_err(|err| capacity_or_io(err, capacity))?;
        }

        let mut writer = builder.into_inner().map_err(|err| capacity_or_io(err, capacity))?;
        writer.inner.flush()?;
        writer.inner.sync_all()?;
        debug!("tar image: {} of {} bytes used", writer.written, capacity);
        Ok(())
    }

    fn shrink(&self, image: &Path) -> Result<u64, FormatError> {
        let mut archive = tar::Archive::new(File::open(image)?);
        let mut end = 0u64;
        for entry in archive.entries()? {
            let entry = entry?;
            let data_end = entry.raw_file_position() + entry.size();
            end = data_end.div_ceil(512) * 512;
        }
        // Two zero blocks terminate the archive.
        let used = end + 1024;
        let file = OpenOptions::new().write(true).open(image)?;
        file.set_len(used)?;
        file.sync_all()?;
        Ok(used)
    }
}

struct BoundedWriter {
    inner: File,
    written: u64,
    capacity: u64,
}

#[derive(Debug, Error)]
#[error("image capacity exceeded")]
struct ImageFull;

impl Write for BoundedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.capacity {
            return Err(io::Error::new(io::ErrorKind::Other, ImageFull));
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn capacity_or_io(err: io::Error, capacity: u64) -> FormatError {
    if err.get_ref().is_some_and(|inner| inner.is::<ImageFull>()) {
        FormatError::CapacityExceeded { capacity }
    } else {
        FormatError::Io(err)
    }
}

/// ext4 formatter driving e2fsprogs.
#[derive(Debug, Clone)]
pub struct Ext4Formatter {
    /// Volume label.
    pub label: String,
    /// Directory holding the e2fsprogs binaries; `PATH` lookup when unset.
    pub tool_dir: Option<PathBuf>,
}

impl Default for Ext4Formatter {
    fn default() -> Self {
        Self { label: "rootfs".into(), tool_dir: None }
    }
}

impl Ext4Formatter {
    fn tool(&self, name: &str) -> Command {
        match &self.tool_dir {
            Some(dir) => Command::new(dir.join(name)),
            None => Command::new(name),
        }
    }

    fn run(&self, name: &str, args: &[&OsStr], ok_codes: &[i32]) -> Result<String, FormatError> {
        let output = self.tool(name).args(args).output().map_err(|err| FormatError::Tool {
            tool: name.into(),
            detail: format!("spawn failed: {err}"),
        })?;
        let code = output.status.code().unwrap_or(-1);
        if !ok_codes.contains(&code) {
            return Err(FormatError::Tool {
                tool: name.into(),
                detail: format!(
                    "exit {code}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ImageFormatter for Ext4Formatter {
    fn name(&self) -> &'static str {
        "ext4"
    }

    fn format(&self, tree: &Path, image: &Path, capacity: u64) -> Result<(), FormatError> {
        self.run(
            "mkfs.ext4",
            &[
                "-q".as_ref(),
                "-F".as_ref(),
                "-L".as_ref(),
                self.label.as_ref(),
                "-E".as_ref(),
                "root_owner=0:0".as_ref(),
                "-d".as_ref(),
                tree.as_os_str(),
                image.as_os_str(),
            ],
            &[0],
        )
        .map_err(|err| match err {
            FormatError::Tool { detail, .. } if detail.contains("No space left") => {
                FormatError::CapacityExceeded { capacity }
            }
            other => other,
        })?;
        Ok(())
    }

    fn shrink(&self, image: &Path) -> Result<u64, FormatError> {
        // e2fsck exit 1 means errors were corrected.
        self.run("e2fsck", &["-f".as_ref(), "-y".as_ref(), image.as_os_str()], &[0, 1])?;
        self.run("resize2fs", &["-M".as_ref(), image.as_os_str()], &[0])?;
        let summary = self.run("dumpe2fs", &["-h".as_ref(), image.as_os_str()], &[0])?;

        let block_count = dumpe2fs_field(&summary, "Block count")?;
        let block_size = dumpe2fs_field(&summary, "Block size")?;
        let used = block_count * block_size;

        let file = OpenOptions::new().write(true).open(image)?;
        file.set_len(used)?;
        file.sync_all()?;
        Ok(used)
    }
}

fn dumpe2fs_field(summary: &str, field: &str) -> Result<u64, FormatError> {
    summary
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == field).then(|| value.trim().parse::<u64>().ok()).flatten()
        })
        .ok_or_else(|| FormatError::Tool {
            tool: "dumpe2fs".into(),
            detail: format!("`{field}` missing from superblock summary"),
        })
}
