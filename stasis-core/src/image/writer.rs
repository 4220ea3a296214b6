// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Atomic image persistence.
//!
//! Images are written to a hidden temp file in the target directory, synced,
//! and renamed into place, then the directory itself is synced. A reader sees
//! either the previous complete image or the new complete image, never a
//! partial one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use super::{format, SnapshotImage};
use crate::error::SnapshotError;
use crate::types::{SnapshotLabel, IMAGE_EXTENSION};

const TEMP_SUFFIX: &str = ".tmp";

/// Sequence number that keeps temp names distinct across writers in one process.
static NEXT_TEMP: AtomicU64 = AtomicU64::new(0);

/// A finished image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenImage {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Removes the temp file unless the write completed.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temp image");
                }
            }
        }
    }
}

/// Writes images into one directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    directory: PathBuf,
}

impl SnapshotWriter {
    /// Create the directory if needed and clear temp files left by writers
    /// that no longer exist.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| SnapshotError::WriteFailed {
            path: directory.clone(),
            reason: format!("cannot create snapshot directory: {}", e),
        })?;

        let writer = Self { directory };
        match writer.cleanup_temp_files() {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(directory = %writer.directory.display(), removed, "Removed stale temp images")
            }
            Err(e) => {
                tracing::warn!(directory = %writer.directory.display(), error = %e, "Temp image cleanup failed")
            }
        }
        Ok(writer)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Final path of the image for `label`.
    pub fn image_path(&self, label: &SnapshotLabel) -> PathBuf {
        self.directory.join(label.file_name())
    }

    /// A temp path no other write, in this process or another, is using.
    fn temp_path(&self, label: &SnapshotLabel) -> PathBuf {
        self.directory.join(format!(
            ".{}.{}.{}{}",
            label.file_name(),
            std::process::id(),
            NEXT_TEMP.fetch_add(1, Ordering::Relaxed),
            TEMP_SUFFIX
        ))
    }

    /// Encode and atomically persist `image` under its label.
    pub fn write(&self, image: &SnapshotImage) -> Result<WrittenImage, SnapshotError> {
        self.persist(&image.header.label, |out| format::encode(image, out))
    }

    /// Atomically persist whatever `encode` writes under `label`. If `encode`
    /// or any later step fails, the temp file is removed and an existing image
    /// with the same label is left untouched.
    pub fn persist<F>(&self, label: &SnapshotLabel, encode: F) -> Result<WrittenImage, SnapshotError>
    where
        F: FnOnce(&mut BufWriter<File>) -> io::Result<u64>,
    {
        let final_path = self.image_path(label);
        let temp_path = self.temp_path(label);
        let failed = |stage: &str, e: io::Error| SnapshotError::WriteFailed {
            path: final_path.clone(),
            reason: format!("{}: {}", stage, e),
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| failed("create temp file", e))?;
        let mut temp = TempFile {
            path: temp_path.clone(),
            armed: true,
        };

        let mut out = BufWriter::new(file);
        let bytes = encode(&mut out).map_err(|e| failed("encode", e))?;
        let file = out
            .into_inner()
            .map_err(|e| failed("flush", e.into_error()))?;
        file.sync_all().map_err(|e| failed("fsync", e))?;
        drop(file);

        fs::rename(&temp_path, &final_path).map_err(|e| failed("rename", e))?;
        temp.armed = false;

        if let Err(e) = File::open(&self.directory).and_then(|dir| dir.sync_all()) {
            tracing::warn!(directory = %self.directory.display(), error = %e, "Directory fsync failed");
        }

        tracing::debug!(path = %final_path.display(), bytes, "Image persisted");

        Ok(WrittenImage {
            path: final_path,
            bytes,
        })
    }

    /// Remove temp files whose writer process is gone. Temps owned by this
    /// process belong to writes still in flight and are left alone. Returns
    /// how many were removed.
    pub fn cleanup_temp_files(&self) -> io::Result<usize> {
        let own_pid = std::process::id();
        let mut removed = 0;

        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(pid) = temp_owner(name) else {
                continue;
            };
            if pid == own_pid || process_alive(pid) {
                continue;
            }
            fs::remove_file(entry.path())?;
            removed += 1;
        }

        Ok(removed)
    }
}

/// Pid embedded in a temp file name `.<label>.snap.<pid>.<seq>.tmp`.
fn temp_owner(name: &str) -> Option<u32> {
    let rest = name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    let (rest, seq) = rest.rsplit_once('.')?;
    let (stem, pid) = rest.rsplit_once('.')?;
    if !stem.ends_with(&format!(".{}", IMAGE_EXTENSION)) || seq.parse::<u64>().is_err() {
        return None;
    }
    pid.parse().ok()
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(nix::Error::ESRCH))
}
