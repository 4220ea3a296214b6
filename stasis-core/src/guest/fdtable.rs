// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Guest descriptor table.
//!
//! Maps guest descriptor numbers to host descriptors. Numbers are allocated
//! lowest-free first, like the kernel does, and are independent of the host
//! numbers backing them.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Whence;

use crate::error::GuestError;
use crate::types::GuestFd;

/// One open guest descriptor.
#[derive(Debug)]
struct OpenDescriptor {
    file: OwnedFd,
    /// Restart fails when this descriptor cannot be reconstructed.
    required: bool,
}

/// Thread-safe guest descriptor table.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: DashMap<GuestFd, OpenDescriptor>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `file` at the lowest free guest number.
    pub fn install(&self, file: OwnedFd, required: bool) -> Result<GuestFd, GuestError> {
        for number in 0..i32::MAX {
            let fd = GuestFd::new(number)?;
            if let Entry::Vacant(vacant) = self.entries.entry(fd) {
                vacant.insert(OpenDescriptor { file, required });
                return Ok(fd);
            }
        }
        Err(GuestError::os("install", nix::Error::EMFILE))
    }

    /// Install `file` at a specific guest number.
    pub fn install_at(&self, fd: GuestFd, file: OwnedFd, required: bool) -> Result<(), GuestError> {
        match self.entries.entry(fd) {
            Entry::Occupied(_) => Err(GuestError::DescriptorInUse { fd }),
            Entry::Vacant(vacant) => {
                vacant.insert(OpenDescriptor { file, required });
                Ok(())
            }
        }
    }

    /// Open a host path for the guest.
    pub fn open(
        &self,
        path: &Path,
        flags: OFlag,
        mode: Mode,
        required: bool,
    ) -> Result<GuestFd, GuestError> {
        let raw = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, mode)
            .map_err(|e| GuestError::os("open", e))?;
        // SAFETY: open returned a fresh descriptor we now own
        let file = unsafe { OwnedFd::from_raw_fd(raw) };
        self.install(file, required)
    }

    /// Create a pipe, returning `(read end, write end)`.
    pub fn pipe(&self) -> Result<(GuestFd, GuestFd), GuestError> {
        let (read, write) = nix::unistd::pipe().map_err(|e| GuestError::os("pipe", e))?;
        let read = self.install(read, false)?;
        let write = self.install(write, false)?;
        Ok((read, write))
    }

    pub fn read(&self, fd: GuestFd, buf: &mut [u8]) -> Result<usize, GuestError> {
        let file = self.duplicate(fd)?;
        nix::unistd::read(file.as_raw_fd(), buf).map_err(|e| GuestError::os("read", e))
    }

    pub fn write(&self, fd: GuestFd, data: &[u8]) -> Result<usize, GuestError> {
        let file = self.duplicate(fd)?;
        nix::unistd::write(&file, data).map_err(|e| GuestError::os("write", e))
    }

    /// Reposition the file offset, returning the new offset.
    pub fn seek(&self, fd: GuestFd, offset: i64, whence: Whence) -> Result<u64, GuestError> {
        let file = self.duplicate(fd)?;
        let position = nix::unistd::lseek(file.as_raw_fd(), offset, whence)
            .map_err(|e| GuestError::os("lseek", e))?;
        Ok(position as u64)
    }

    pub fn close(&self, fd: GuestFd) -> Result<(), GuestError> {
        self.entries
            .remove(&fd)
            .map(|_| ())
            .ok_or(GuestError::BadDescriptor { fd })
    }

    pub fn contains(&self, fd: GuestFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open guest numbers in ascending order.
    pub fn numbers(&self) -> Vec<GuestFd> {
        let mut numbers: Vec<GuestFd> = self.entries.iter().map(|e| *e.key()).collect();
        numbers.sort_unstable();
        numbers
    }

    /// Visit every open descriptor in ascending order.
    pub(crate) fn inspect<T, E>(
        &self,
        mut visit: impl FnMut(GuestFd, BorrowedFd<'_>, bool) -> Result<T, E>,
    ) -> Result<Vec<T>, E> {
        let mut out = Vec::with_capacity(self.entries.len());
        for fd in self.numbers() {
            if let Some(entry) = self.entries.get(&fd) {
                out.push(visit(fd, entry.file.as_fd(), entry.required)?);
            }
        }
        Ok(out)
    }

    /// Duplicate the host descriptor so blocking I/O does not hold the table.
    fn duplicate(&self, fd: GuestFd) -> Result<OwnedFd, GuestError> {
        let entry = self
            .entries
            .get(&fd)
            .ok_or(GuestError::BadDescriptor { fd })?;
        entry.file.try_clone().map_err(|e| GuestError::Io {
            context: "duplicating guest descriptor",
            source: e,
        })
    }
}
