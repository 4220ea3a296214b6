// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GuestError, SnapshotError};

/// Maximum snapshot label length in bytes.
const MAX_LABEL_LEN: usize = 128;

/// File extension of snapshot images.
pub const IMAGE_EXTENSION: &str = "snap";

/// Validated snapshot label.
/// Must be non-empty, ASCII alphanumeric with `-`, `_` or `.`, max 128 bytes,
/// and must not start with a dot (those names are reserved for temp files).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotLabel(String);

impl SnapshotLabel {
    /// Create a new SnapshotLabel with validation.
    pub fn new(label: impl Into<String>) -> Result<Self, SnapshotError> {
        let label = label.into();

        if label.is_empty() {
            return Err(SnapshotError::InvalidLabel {
                label,
                reason: "Label cannot be empty".to_string(),
            });
        }

        if label.len() > MAX_LABEL_LEN {
            return Err(SnapshotError::InvalidLabel {
                reason: format!("Label too long: {} bytes (max {})", label.len(), MAX_LABEL_LEN),
                label,
            });
        }

        if label.starts_with('.') {
            return Err(SnapshotError::InvalidLabel {
                label,
                reason: "Label cannot start with '.'".to_string(),
            });
        }

        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(SnapshotError::InvalidLabel {
                label,
                reason: "Label must contain only ASCII alphanumerics, '-', '_' and '.'"
                    .to_string(),
            });
        }

        Ok(Self(label))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the image this label identifies.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.0, IMAGE_EXTENSION)
    }
}

impl fmt::Display for SnapshotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SnapshotLabel {
    type Error = SnapshotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SnapshotLabel> for String {
    fn from(label: SnapshotLabel) -> Self {
        label.0
    }
}

/// Identifier of a guest thread (virtual CPU).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VcpuId(u32);

impl VcpuId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner id value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vcpu-{}", self.0)
    }
}

impl fmt::Debug for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Validated guest descriptor number.
/// Guest descriptor numbers are independent of the host descriptors backing
/// them and must be non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct GuestFd(i32);

impl GuestFd {
    /// Create a new GuestFd with validation.
    pub fn new(fd: i32) -> Result<Self, GuestError> {
        if fd < 0 {
            return Err(GuestError::BadDescriptor { fd: Self(fd) });
        }
        Ok(Self(fd))
    }

    /// Get the inner descriptor number.
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for GuestFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for GuestFd {
    type Error = GuestError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GuestFd> for i32 {
    fn from(fd: GuestFd) -> Self {
        fd.0
    }
}

/// Guest-visible access permissions of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub const NONE: Self = Self::from_bits(0);
    pub const READ: Self = Self::from_bits(Self::R);
    pub const READ_WRITE: Self = Self::from_bits(Self::R | Self::W);
    pub const READ_EXEC: Self = Self::from_bits(Self::R | Self::X);

    const R: u8 = 0b001;
    const W: u8 = 0b010;
    const X: u8 = 0b100;

    /// Decode from the on-disk bit representation. Unknown bits are ignored.
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & Self::R != 0,
            write: bits & Self::W != 0,
            exec: bits & Self::X != 0,
        }
    }

    /// Encode to the on-disk bit representation.
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.read {
            bits |= Self::R;
        }
        if self.write {
            bits |= Self::W;
        }
        if self.exec {
            bits |= Self::X;
        }
        bits
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.exec { 'x' } else { '-' }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_valid() {
        assert!(SnapshotLabel::new("test_snap").is_ok());
        assert!(SnapshotLabel::new("build-42.v2").is_ok());
        assert_eq!(
            SnapshotLabel::new("test_snap").unwrap().file_name(),
            "test_snap.snap"
        );
    }

    #[test]
    fn test_label_invalid() {
        assert!(SnapshotLabel::new("").is_err());
        assert!(SnapshotLabel::new("a".repeat(129)).is_err());
        assert!(SnapshotLabel::new("../etc/passwd").is_err());
        assert!(SnapshotLabel::new("dir/label").is_err());
        assert!(SnapshotLabel::new(".hidden").is_err());
        assert!(SnapshotLabel::new("with space").is_err());
    }

    #[test]
    fn test_guest_fd() {
        assert!(GuestFd::new(0).is_ok());
        assert!(GuestFd::new(-1).is_err());
    }

    #[test]
    fn test_protection_bits() {
        for bits in 0..8u8 {
            assert_eq!(Protection::from_bits(bits).bits(), bits);
        }
        assert_eq!(Protection::READ_WRITE.to_string(), "rw-");
        assert_eq!(Protection::NONE.to_string(), "---");
    }

    #[test]
    fn test_vcpu_id_display() {
        assert_eq!(VcpuId::new(3).to_string(), "vcpu-3");
        assert_eq!(format!("{:?}", vec![VcpuId::new(1)]), "[vcpu-1]");
    }
}
