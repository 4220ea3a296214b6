// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Guest address space.
//!
//! Guest virtual addresses are backed by private host mappings. Guest accesses
//! are checked against the permissions recorded on each region; the host
//! mapping itself stays readable and writable (guard regions excepted) so the
//! engine can capture and restore contents. All unsafe operations are
//! encapsulated with bounds checking.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use crate::error::GuestError;
use crate::image::{MemoryRegion, RegionKind};
use crate::types::Protection;

/// Granularity of guest mappings.
pub const GUEST_PAGE_SIZE: u64 = 4096;

/// Round `value` up to the next page boundary.
pub(crate) fn page_round_up(value: u64) -> u64 {
    value.div_ceil(GUEST_PAGE_SIZE) * GUEST_PAGE_SIZE
}

/// What backs a guest region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled private memory.
    Anonymous,
    /// Private mapping of a host file.
    File { path: PathBuf, offset: u64 },
    /// Reserved, inaccessible address range with no contents.
    Guard,
}

/// A host mapping backing one guest region.
///
/// This struct owns the mapped memory and will unmap it on drop.
struct HostMapping {
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapped region in bytes.
    size: usize,
}

// SAFETY: HostMapping owns its memory; the pointer is never aliased mutably
// by the engine outside of quiesced capture/restore.
unsafe impl Send for HostMapping {}

// SAFETY: concurrent guest accesses behave like accesses to shared physical
// memory; the guest is responsible for synchronizing its own threads.
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Map `size` bytes of zeroed private memory.
    fn anonymous(size: usize) -> Result<Self, GuestError> {
        Self::map(
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    }

    /// Reserve `size` bytes of inaccessible address space.
    fn reserve(size: usize) -> Result<Self, GuestError> {
        Self::map(
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    }

    /// Map `size` bytes of `file` starting at `offset`, copy-on-write.
    fn file(file: &File, offset: u64, size: usize) -> Result<Self, GuestError> {
        Self::map(
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            offset as libc::off_t,
        )
    }

    fn map(
        size: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
        offset: libc::off_t,
    ) -> Result<Self, GuestError> {
        // SAFETY: size is non-zero and page aligned (checked by callers),
        // fd is either -1 with MAP_ANONYMOUS or a valid open descriptor.
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, fd, offset) };

        if ptr == libc::MAP_FAILED {
            return Err(GuestError::Io {
                context: "mmap guest region",
                source: std::io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| GuestError::Io {
            context: "mmap guest region",
            source: std::io::Error::other("mmap returned null"),
        })?;

        Ok(Self { ptr, size })
    }

    /// View the whole mapping.
    ///
    /// # Safety
    /// The mapping must be accessible and no thread may write to it while the
    /// slice is alive.
    unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.size)
    }

    /// Mutable view of the whole mapping.
    ///
    /// # Safety
    /// The mapping must be accessible and the caller must have exclusive
    /// access to it while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size)
    }

    fn copy_out(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= self.size);
        // SAFETY: bounds checked by the caller against the region length.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        }
    }

    fn copy_in(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.size);
        // SAFETY: bounds checked by the caller against the region length.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len()) }
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set during creation
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                size = self.size,
                error = %std::io::Error::last_os_error(),
                "Failed to unmap guest region"
            );
        }
    }
}

/// One mapped range of the guest address space.
pub struct GuestRegion {
    start: u64,
    length: u64,
    protection: Protection,
    backing: Backing,
    name: Option<String>,
    file: Option<File>,
    host: HostMapping,
}

impl GuestRegion {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// First address past the region.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    /// Bytes of the backing file that cover this region, rounded to pages.
    /// Pages past that point would fault on access.
    fn file_coverage(&self) -> Result<u64, std::io::Error> {
        match (&self.backing, &self.file) {
            (Backing::File { offset, .. }, Some(file)) => {
                let len = file.metadata()?.len();
                Ok(page_round_up(len.saturating_sub(*offset)).min(self.length))
            }
            _ => Ok(self.length),
        }
    }

    /// Check that every byte of the region can be read by the host.
    pub(crate) fn verify_readable(&self) -> Result<(), String> {
        if matches!(self.backing, Backing::Guard) {
            return Ok(());
        }
        let covered = self
            .file_coverage()
            .map_err(|e| format!("region {:#x}: cannot stat backing file: {}", self.start, e))?;
        if covered < self.length {
            return Err(format!(
                "region {:#x}+{:#x}: backing file covers only {:#x} bytes, page at {:#x} is unreadable",
                self.start,
                self.length,
                covered,
                self.start + covered
            ));
        }
        Ok(())
    }

    /// Contents of the region. Guard regions have none.
    ///
    /// Callers must hold the guest quiesced and must have checked
    /// [`GuestRegion::verify_readable`].
    pub(crate) fn contents(&self) -> &[u8] {
        match self.backing {
            Backing::Guard => &[],
            // SAFETY: non-guard host mappings are always PROT_READ; the guest
            // is quiesced so nothing writes concurrently.
            _ => unsafe { self.host.as_slice() },
        }
    }

    /// Mutable contents for restore. Guard regions have none.
    ///
    /// # Safety
    /// No vCPU may be running and no other slice of this region may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn contents_mut(&self) -> &mut [u8] {
        match self.backing {
            Backing::Guard => &mut [],
            _ => self.host.as_mut_slice(),
        }
    }

    /// Region descriptor as recorded in an image, without contents.
    pub(crate) fn kind(&self) -> RegionKind {
        match &self.backing {
            Backing::Anonymous => RegionKind::Anonymous {
                name: self.name.clone(),
            },
            Backing::File { path, offset } => RegionKind::File {
                path: path.clone(),
                offset: *offset,
            },
            Backing::Guard => RegionKind::Guard,
        }
    }
}

impl std::fmt::Debug for GuestRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRegion")
            .field("start", &format_args!("{:#x}", self.start))
            .field("length", &format_args!("{:#x}", self.length))
            .field("protection", &self.protection)
            .field("backing", &self.backing)
            .field("name", &self.name)
            .finish()
    }
}

/// The guest address space: disjoint regions keyed (and so sorted) by start.
#[derive(Debug, Default)]
pub struct GuestMemory {
    regions: RwLock<BTreeMap<u64, GuestRegion>>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map zero-filled memory at `start`.
    pub fn map_anonymous(
        &self,
        start: u64,
        length: u64,
        protection: Protection,
    ) -> Result<(), GuestError> {
        Self::check_range(start, length)?;
        let host = HostMapping::anonymous(length as usize)?;
        self.insert(GuestRegion {
            start,
            length,
            protection,
            backing: Backing::Anonymous,
            name: None,
            file: None,
            host,
        })
    }

    /// Map `length` bytes of the file at `path`, from `offset`, at `start`.
    /// Guest writes are private to the guest.
    pub fn map_file(
        &self,
        start: u64,
        path: &Path,
        offset: u64,
        length: u64,
        protection: Protection,
    ) -> Result<(), GuestError> {
        Self::check_range(start, length)?;
        if offset % GUEST_PAGE_SIZE != 0 {
            return Err(GuestError::Unaligned { value: offset });
        }
        let file = File::open(path).map_err(|e| GuestError::Io {
            context: "opening file for guest mapping",
            source: e,
        })?;
        let host = HostMapping::file(&file, offset, length as usize)?;
        self.insert(GuestRegion {
            start,
            length,
            protection,
            backing: Backing::File {
                path: path.to_path_buf(),
                offset,
            },
            name: Some(path.display().to_string()),
            file: Some(file),
            host,
        })
    }

    /// Reserve an inaccessible guard range at `start`.
    pub fn map_guard(&self, start: u64, length: u64) -> Result<(), GuestError> {
        Self::check_range(start, length)?;
        let host = HostMapping::reserve(length as usize)?;
        self.insert(GuestRegion {
            start,
            length,
            protection: Protection::NONE,
            backing: Backing::Guard,
            name: None,
            file: None,
            host,
        })
    }

    /// Remove the region starting at `start`.
    pub fn unmap(&self, start: u64) -> Result<(), GuestError> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        regions
            .remove(&start)
            .map(|_| ())
            .ok_or(GuestError::NoMapping { start })
    }

    /// Change the guest-visible permissions of the region starting at `start`.
    pub fn protect(&self, start: u64, protection: Protection) -> Result<(), GuestError> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .get_mut(&start)
            .ok_or(GuestError::NoMapping { start })?;
        if matches!(region.backing, Backing::Guard) {
            return Err(GuestError::Fault {
                addr: start,
                access: "protect",
            });
        }
        region.protection = protection;
        Ok(())
    }

    /// Name an anonymous region (shown in images and `inspect`). An empty
    /// name clears it.
    pub fn set_name(&self, start: u64, name: impl Into<String>) -> Result<(), GuestError> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .get_mut(&start)
            .ok_or(GuestError::NoMapping { start })?;
        let name = name.into();
        region.name = (!name.is_empty()).then_some(name);
        Ok(())
    }

    /// Copy guest memory at `addr` into `buf`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestError> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let region = Self::lookup(&regions, addr, buf.len() as u64, "read")?;
        if !region.protection.read {
            return Err(GuestError::Fault { addr, access: "read" });
        }
        Self::check_file_coverage(region, addr, buf.len() as u64)?;
        region.host.copy_out((addr - region.start) as usize, buf);
        Ok(())
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), GuestError> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let region = Self::lookup(&regions, addr, data.len() as u64, "write")?;
        if !region.protection.write {
            return Err(GuestError::Fault {
                addr,
                access: "write",
            });
        }
        Self::check_file_coverage(region, addr, data.len() as u64)?;
        region.host.copy_in((addr - region.start) as usize, data);
        Ok(())
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, GuestError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), GuestError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Number of mapped regions.
    pub fn region_count(&self) -> usize {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `(start, length, protection)` of every region, in address order.
    pub fn layout(&self) -> Vec<(u64, u64, Protection)> {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| (r.start, r.length, r.protection))
            .collect()
    }

    /// Read access to the region map for capture.
    pub(crate) fn regions(&self) -> RwLockReadGuard<'_, BTreeMap<u64, GuestRegion>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map a region recorded in an image. Contents are copied separately by
    /// the restart loader.
    pub(crate) fn map_recorded(&self, recorded: &MemoryRegion) -> Result<(), GuestError> {
        match &recorded.kind {
            RegionKind::Guard => self.map_guard(recorded.start, recorded.length),
            RegionKind::Anonymous { name } => {
                self.map_anonymous(recorded.start, recorded.length, recorded.permissions)?;
                if let Some(name) = name {
                    self.set_name(recorded.start, name.clone())?;
                }
                Ok(())
            }
            // Restored as a private copy of the captured bytes, keeping the origin name
            RegionKind::File { path, .. } => {
                self.map_anonymous(recorded.start, recorded.length, recorded.permissions)?;
                self.set_name(recorded.start, path.display().to_string())
            }
        }
    }

    fn check_range(start: u64, length: u64) -> Result<(), GuestError> {
        if start % GUEST_PAGE_SIZE != 0 {
            return Err(GuestError::Unaligned { value: start });
        }
        if length == 0 || length % GUEST_PAGE_SIZE != 0 {
            return Err(GuestError::Unaligned { value: length });
        }
        if start.checked_add(length).is_none() || usize::try_from(length).is_err() {
            return Err(GuestError::Overlap { start, length });
        }
        Ok(())
    }

    fn insert(&self, region: GuestRegion) -> Result<(), GuestError> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);

        let overlaps_prev = regions
            .range(..region.end())
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > region.start);
        if overlaps_prev {
            return Err(GuestError::Overlap {
                start: region.start,
                length: region.length,
            });
        }

        tracing::trace!(
            start = format_args!("{:#x}", region.start),
            length = region.length,
            protection = %region.protection,
            "Mapped guest region"
        );

        regions.insert(region.start, region);
        Ok(())
    }

    fn lookup<'a>(
        regions: &'a BTreeMap<u64, GuestRegion>,
        addr: u64,
        len: u64,
        access: &'static str,
    ) -> Result<&'a GuestRegion, GuestError> {
        regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr, len))
            .filter(|region| !matches!(region.backing, Backing::Guard))
            .ok_or(GuestError::Fault { addr, access })
    }

    fn check_file_coverage(region: &GuestRegion, addr: u64, len: u64) -> Result<(), GuestError> {
        if !matches!(region.backing, Backing::File { .. }) {
            return Ok(());
        }
        let covered = region.file_coverage().map_err(|e| GuestError::Io {
            context: "stat of guest mapping backing file",
            source: e,
        })?;
        if addr - region.start + len > covered {
            return Err(GuestError::Fault { addr, access: "bus" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = GUEST_PAGE_SIZE;

    #[test]
    fn test_read_write_roundtrip() {
        let mem = GuestMemory::new();
        mem.map_anonymous(0x10000, PAGE, Protection::READ_WRITE).unwrap();

        mem.write_u64(0x10008, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u64(0x10008).unwrap(), 0xdead_beef);

        // Fresh memory is zeroed
        assert_eq!(mem.read_u64(0x10010).unwrap(), 0);
    }

    #[test]
    fn test_overlap_rejected() {
        let mem = GuestMemory::new();
        mem.map_anonymous(0x10000, 2 * PAGE, Protection::READ_WRITE).unwrap();

        assert!(matches!(
            mem.map_anonymous(0x11000, PAGE, Protection::READ),
            Err(GuestError::Overlap { .. })
        ));
        assert!(matches!(
            mem.map_anonymous(0xF000, 2 * PAGE, Protection::READ),
            Err(GuestError::Overlap { .. })
        ));
        // Adjacent is fine
        mem.map_anonymous(0x12000, PAGE, Protection::READ).unwrap();
        mem.map_anonymous(0xF000, PAGE, Protection::READ).unwrap();
        assert_eq!(mem.region_count(), 3);
    }

    #[test]
    fn test_unaligned_rejected() {
        let mem = GuestMemory::new();
        assert!(mem.map_anonymous(0x10001, PAGE, Protection::READ).is_err());
        assert!(mem.map_anonymous(0x10000, 100, Protection::READ).is_err());
        assert!(mem.map_anonymous(0x10000, 0, Protection::READ).is_err());
    }

    #[test]
    fn test_permissions_enforced() {
        let mem = GuestMemory::new();
        mem.map_anonymous(0x10000, PAGE, Protection::READ).unwrap();
        mem.map_guard(0x11000, PAGE).unwrap();

        assert!(mem.write_u64(0x10000, 1).is_err());
        assert!(mem.read_u64(0x10000).is_ok());
        assert!(mem.read_u64(0x11000).is_err());

        mem.protect(0x10000, Protection::READ_WRITE).unwrap();
        assert!(mem.write_u64(0x10000, 1).is_ok());
    }

    #[test]
    fn test_access_spanning_regions_faults() {
        let mem = GuestMemory::new();
        mem.map_anonymous(0x10000, PAGE, Protection::READ_WRITE).unwrap();
        mem.map_anonymous(0x11000, PAGE, Protection::READ_WRITE).unwrap();

        assert!(mem.write_u64(0x10FFC, 7).is_err());
        assert!(mem.read_u64(0x9000).is_err());
    }

    #[test]
    fn test_empty_name_clears() {
        let mem = GuestMemory::new();
        mem.map_anonymous(0x10000, PAGE, Protection::READ_WRITE).unwrap();
        mem.set_name(0x10000, "heap").unwrap();
        mem.set_name(0x10000, "").unwrap();

        let regions = mem.regions();
        let region = regions.get(&0x10000).unwrap();
        assert_eq!(region.name(), None);
        assert_eq!(region.kind(), RegionKind::Anonymous { name: None });
    }

    #[test]
    fn test_layout_sorted() {
        let mem = GuestMemory::new();
        mem.map_anonymous(0x30000, PAGE, Protection::READ).unwrap();
        mem.map_anonymous(0x10000, PAGE, Protection::READ_WRITE).unwrap();
        mem.map_guard(0x20000, PAGE).unwrap();

        let starts: Vec<u64> = mem.layout().iter().map(|(s, _, _)| *s).collect();
        assert_eq!(starts, vec![0x10000, 0x20000, 0x30000]);

        mem.unmap(0x20000).unwrap();
        assert!(mem.unmap(0x20000).is_err());
        assert_eq!(mem.region_count(), 2);
    }

    #[test]
    fn test_file_mapping_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.bin");
        std::fs::write(&path, vec![0x5Au8; 2 * PAGE as usize]).unwrap();

        let mem = GuestMemory::new();
        mem.map_file(0x40000, &path, 0, 2 * PAGE, Protection::READ).unwrap();
        let mut buf = [0u8; 4];
        mem.read(0x41000, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 4]);

        {
            let regions = mem.regions();
            assert!(regions[&0x40000].verify_readable().is_ok());
        }

        // Shrink the file under the mapping: the second page is now past EOF
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(10).unwrap();

        assert!(matches!(
            mem.read(0x41000, &mut buf),
            Err(GuestError::Fault { access: "bus", .. })
        ));
        mem.read(0x40000, &mut buf).unwrap();

        let regions = mem.regions();
        assert!(regions[&0x40000].verify_readable().is_err());
    }
}
