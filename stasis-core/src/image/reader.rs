// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Loading images from disk.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use super::{format, ImageHeader, SnapshotImage};
use crate::error::SnapshotError;
use crate::types::{SnapshotLabel, IMAGE_EXTENSION};

/// Reads and lists snapshot images.
pub struct ImageReader;

impl ImageReader {
    /// Read and fully validate the image at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<SnapshotImage, SnapshotError> {
        let path = path.as_ref();
        let mut input = BufReader::new(Self::open_file(path)?);
        format::decode(&mut input)
    }

    /// Read only the header of the image at `path`.
    pub fn read_header(path: impl AsRef<Path>) -> Result<ImageHeader, SnapshotError> {
        let path = path.as_ref();
        let mut input = BufReader::new(Self::open_file(path)?);
        format::decode_header(&mut input).map(|(header, _)| header)
    }

    /// Resolve a label or a path to an image path. A valid label resolves
    /// inside `directory`; anything else is taken as a path.
    pub fn resolve(directory: &Path, label_or_path: &str) -> PathBuf {
        match SnapshotLabel::new(label_or_path) {
            Ok(label) if !label_or_path.ends_with(&format!(".{}", IMAGE_EXTENSION)) => {
                directory.join(label.file_name())
            }
            _ => PathBuf::from(label_or_path),
        }
    }

    /// Headers of every readable image in `directory`, sorted by label.
    /// Temp files and unreadable images are skipped.
    pub fn list(directory: impl AsRef<Path>) -> Result<Vec<(PathBuf, ImageHeader)>, SnapshotError> {
        let directory = directory.as_ref();
        let entries = fs::read_dir(directory).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SnapshotError::ImageNotFound {
                path: directory.to_path_buf(),
            },
            _ => SnapshotError::IncompatibleFormat {
                reason: format!("cannot list {}: {}", directory.display(), e),
            },
        })?;

        let mut images = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_image = path.extension().is_some_and(|ext| ext == IMAGE_EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_image {
                continue;
            }
            match Self::read_header(&path) {
                Ok(header) => images.push((path, header)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image")
                }
            }
        }

        images.sort_by(|a, b| a.1.label.cmp(&b.1.label));
        Ok(images)
    }

    fn open_file(path: &Path) -> Result<File, SnapshotError> {
        File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SnapshotError::ImageNotFound {
                path: path.to_path_buf(),
            },
            _ => SnapshotError::IncompatibleFormat {
                reason: format!("cannot open {}: {}", path.display(), e),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::sample_image;
    use crate::image::writer::SnapshotWriter;

    #[test]
    fn test_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageReader::open(dir.path().join("nope.snap")),
            Err(SnapshotError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_not_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.snap");
        fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(matches!(
            ImageReader::open(&path),
            Err(SnapshotError::IncompatibleFormat { .. })
        ));
    }

    #[test]
    fn test_list_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path()).unwrap();
        writer.write(&sample_image()).unwrap();
        fs::write(dir.path().join("broken.snap"), b"junk").unwrap();
        fs::write(dir.path().join("readme.txt"), b"text").unwrap();

        let images = ImageReader::list(dir.path()).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].1.label.as_str(), "sample");
    }

    #[test]
    fn test_resolve() {
        let dir = Path::new("/snaps");
        assert_eq!(
            ImageReader::resolve(dir, "test_snap"),
            PathBuf::from("/snaps/test_snap.snap")
        );
        assert_eq!(
            ImageReader::resolve(dir, "/other/x.snap"),
            PathBuf::from("/other/x.snap")
        );
        assert_eq!(
            ImageReader::resolve(dir, "local.snap"),
            PathBuf::from("local.snap")
        );
    }
}
