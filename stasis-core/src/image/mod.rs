// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Snapshot image model.
//!
//! An image is everything needed to resume a guest: its address space,
//! the state of every thread, open descriptors and signal dispositions.
//! [`format`] encodes it; [`writer`] and [`reader`] move it to and from disk.

pub mod format;
pub mod reader;
pub mod writer;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::SnapshotError;
use crate::guest::memory::GUEST_PAGE_SIZE;
use crate::guest::signals::{SigSet, SignalDisposition};
use crate::guest::vcpu::RegisterFile;
use crate::types::{GuestFd, Protection, SnapshotLabel};

pub use format::{FORMAT_VERSION, IMAGE_MAGIC};
pub use reader::ImageReader;
pub use writer::{SnapshotWriter, WrittenImage};

/// Machine architecture an image was taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// Architecture of this build.
    pub const fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            Self::Aarch64
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Self::X86_64
        }
    }

    pub const fn code(&self) -> u16 {
        match self {
            Self::X86_64 => 62,
            Self::Aarch64 => 183,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            62 => Some(Self::X86_64),
            183 => Some(Self::Aarch64),
            _ => None,
        }
    }
}

/// Image header: identity and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub version: u16,
    pub arch: Arch,
    pub label: SnapshotLabel,
    pub description: String,
    /// Microseconds since the Unix epoch.
    pub created_at_us: u64,
    /// The guest kept running after this image was taken.
    pub live: bool,
}

impl ImageHeader {
    pub fn new(label: SnapshotLabel, description: impl Into<String>, live: bool) -> Self {
        let created_at_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            version: FORMAT_VERSION,
            arch: Arch::host(),
            label,
            description: description.into(),
            created_at_us,
            live,
        }
    }
}

/// Free-form facts about the captured guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageMetadata {
    /// Name of the guest program; restart requires a match.
    pub program: String,
    /// Non-fatal observations made during capture.
    pub warnings: Vec<String>,
}

/// Origin of a captured memory region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegionKind {
    Anonymous { name: Option<String> },
    File { path: PathBuf, offset: u64 },
    Guard,
}

/// One captured range of the guest address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub length: u64,
    pub permissions: Protection,
    pub kind: RegionKind,
    /// Exact bytes of the region; empty for guard regions.
    #[serde(skip)]
    pub contents: Vec<u8>,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }
}

/// Saved state of one guest thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadState {
    pub thread_id: u32,
    pub registers: RegisterFile,
    pub pending_signals: SigSet,
    pub blocked_signals: SigSet,
    /// The thread that resumes past the snapshot call.
    pub continuation: bool,
}

/// Saved state of every guest thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionState {
    pub threads: Vec<ThreadState>,
}

impl ExecutionState {
    pub fn continuation(&self) -> Option<&ThreadState> {
        self.threads.iter().find(|t| t.continuation)
    }
}

/// Which end of a pipe a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeEnd {
    Read,
    Write,
}

/// Address a listening socket was bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// What a descriptor referred to and how to get it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DescriptorKind {
    /// Regular file, reopened by path and repositioned.
    File { path: PathBuf, offset: u64 },
    Directory { path: PathBuf },
    CharDevice { path: PathBuf },
    /// Empty pipe; `peer` is the other end if the guest holds it.
    Pipe { end: PipeEnd, peer: Option<GuestFd> },
    /// Listening stream socket, rebound to the same address.
    Listener { endpoint: Endpoint },
    /// Could not be captured; the descriptor is absent after restart.
    Closed { was: String, reason: String },
}

impl DescriptorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Directory { .. } => "directory",
            Self::CharDevice { .. } => "char_device",
            Self::Pipe { .. } => "pipe",
            Self::Listener { .. } => "listener",
            Self::Closed { .. } => "closed",
        }
    }
}

/// One captured descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorEntry {
    pub kind: DescriptorKind,
    /// Host open flags (`O_*`).
    pub flags: i32,
    /// Restart fails if this descriptor cannot be reconstructed.
    pub required: bool,
}

/// Captured descriptors keyed by guest number. Numbers are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DescriptorTable {
    entries: BTreeMap<GuestFd, DescriptorEntry>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: GuestFd, entry: DescriptorEntry) -> Result<(), SnapshotError> {
        if self.entries.contains_key(&fd) {
            return Err(SnapshotError::IncompatibleFormat {
                reason: format!("descriptor {} recorded twice", fd),
            });
        }
        self.entries.insert(fd, entry);
        Ok(())
    }

    pub fn get(&self, fd: GuestFd) -> Option<&DescriptorEntry> {
        self.entries.get(&fd)
    }

    pub(crate) fn get_mut(&mut self, fd: GuestFd) -> Option<&mut DescriptorEntry> {
        self.entries.get_mut(&fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = (GuestFd, &DescriptorEntry)> {
        self.entries.iter().map(|(fd, entry)| (*fd, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A complete snapshot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotImage {
    pub header: ImageHeader,
    pub metadata: ImageMetadata,
    pub memory: Vec<MemoryRegion>,
    pub execution: ExecutionState,
    pub descriptors: DescriptorTable,
    pub signals: BTreeMap<i32, SignalDisposition>,
}

impl SnapshotImage {
    /// Total bytes of captured memory contents.
    pub fn memory_bytes(&self) -> u64 {
        self.memory.iter().map(|r| r.contents.len() as u64).sum()
    }

    /// Check the structural invariants restart relies on.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        let incompatible = |reason: String| SnapshotError::IncompatibleFormat { reason };

        let mut previous_end = 0u64;
        for (i, region) in self.memory.iter().enumerate() {
            if region.length == 0
                || region.start % GUEST_PAGE_SIZE != 0
                || region.length % GUEST_PAGE_SIZE != 0
            {
                return Err(incompatible(format!(
                    "memory region {:#x}+{:#x} is not page aligned",
                    region.start, region.length
                )));
            }
            if region.start.checked_add(region.length).is_none() {
                return Err(incompatible(format!(
                    "memory region {:#x} wraps the address space",
                    region.start
                )));
            }
            if i > 0 && region.start < previous_end {
                return Err(incompatible(format!(
                    "memory region {:#x} overlaps or is out of order",
                    region.start
                )));
            }
            if matches!(&region.kind, RegionKind::Anonymous { name: Some(name) } if name.is_empty()) {
                return Err(incompatible(format!(
                    "memory region {:#x} has an empty name",
                    region.start
                )));
            }
            let expected = match region.kind {
                RegionKind::Guard => 0,
                _ => region.length,
            };
            if region.contents.len() as u64 != expected {
                return Err(incompatible(format!(
                    "memory region {:#x} has {} content bytes, expected {}",
                    region.start,
                    region.contents.len(),
                    expected
                )));
            }
            previous_end = region.end();
        }

        let continuations = self.execution.threads.iter().filter(|t| t.continuation).count();
        if continuations != 1 {
            return Err(incompatible(format!(
                "expected exactly one continuation thread, found {}",
                continuations
            )));
        }

        let mut ids: Vec<u32> = self.execution.threads.iter().map(|t| t.thread_id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(incompatible("duplicate thread id".to_string()));
        }

        for (fd, entry) in self.descriptors.iter() {
            if let DescriptorKind::Pipe {
                end,
                peer: Some(peer),
            } = &entry.kind
            {
                let paired = matches!(
                    self.descriptors.get(*peer).map(|e| &e.kind),
                    Some(DescriptorKind::Pipe { end: other, peer: Some(back) })
                        if other != end && *back == fd
                );
                if !paired {
                    return Err(incompatible(format!(
                        "pipe descriptor {} names {} as its peer, which does not match",
                        fd, peer
                    )));
                }
            }
        }

        for &signo in self.signals.keys() {
            if SigSet::single(signo).is_err() {
                return Err(incompatible(format!("invalid signal number {}", signo)));
            }
        }

        Ok(())
    }
}
