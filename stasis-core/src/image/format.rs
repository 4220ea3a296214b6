// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Binary image encoding.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic[8] | version u16 | arch u16 | flags u32 | created_at_us u64
//! | label (u16 len + utf8) | description (u32 len + utf8) | section_count u32
//! section*: tag u32 | length u64 | crc32 u32 | payload[length]
//! ```
//!
//! Each section carries a CRC32 of its payload. Unknown section tags are
//! skipped so newer writers can add sections; missing or duplicated required
//! sections are rejected.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{self, Cursor, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{
    Arch, DescriptorEntry, DescriptorKind, DescriptorTable, Endpoint, ExecutionState,
    ImageHeader, ImageMetadata, MemoryRegion, PipeEnd, RegionKind, SnapshotImage, ThreadState,
};
use crate::error::SnapshotError;
use crate::guest::signals::{SigSet, SignalDisposition};
use crate::guest::vcpu::{RegisterFile, GPR_COUNT};
use crate::types::{GuestFd, Protection, SnapshotLabel};

/// Magic bytes at the start of every image.
pub const IMAGE_MAGIC: [u8; 8] = *b"STASIS\0\x01";

/// Current image format version.
pub const FORMAT_VERSION: u16 = 1;

const FLAG_LIVE: u32 = 1;

/// Upper bound on any length-prefixed string in an image.
const MAX_STRING_LEN: usize = 1 << 20;

const TAG_METADATA: u32 = 1;
const TAG_MEMORY: u32 = 2;
const TAG_EXECUTION: u32 = 3;
const TAG_DESCRIPTORS: u32 = 4;
const TAG_SIGNALS: u32 = 5;

fn incompatible(reason: impl Into<String>) -> SnapshotError {
    SnapshotError::IncompatibleFormat {
        reason: reason.into(),
    }
}

fn truncated(e: io::Error) -> SnapshotError {
    incompatible(format!("truncated or unreadable image: {}", e))
}

// =========================================================================
// Encoding
// =========================================================================

/// Encode `image` into `out`, returning the number of bytes written.
pub fn encode<W: Write>(image: &SnapshotImage, out: &mut W) -> io::Result<u64> {
    let mut header = Vec::with_capacity(64);
    header.write_all(&IMAGE_MAGIC)?;
    header.write_u16::<LittleEndian>(image.header.version)?;
    header.write_u16::<LittleEndian>(image.header.arch.code())?;
    header.write_u32::<LittleEndian>(if image.header.live { FLAG_LIVE } else { 0 })?;
    header.write_u64::<LittleEndian>(image.header.created_at_us)?;
    write_str16(&mut header, image.header.label.as_str())?;
    write_str32(&mut header, &image.header.description)?;

    let sections = [
        (TAG_METADATA, encode_metadata(&image.metadata)?),
        (TAG_MEMORY, encode_memory(&image.memory)?),
        (TAG_EXECUTION, encode_execution(&image.execution)?),
        (TAG_DESCRIPTORS, encode_descriptors(&image.descriptors)?),
        (TAG_SIGNALS, encode_signals(&image.signals)?),
    ];
    header.write_u32::<LittleEndian>(sections.len() as u32)?;

    out.write_all(&header)?;
    let mut written = header.len() as u64;

    for (tag, payload) in &sections {
        out.write_u32::<LittleEndian>(*tag)?;
        out.write_u64::<LittleEndian>(payload.len() as u64)?;
        out.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
        out.write_all(payload)?;
        written += 16 + payload.len() as u64;
    }

    Ok(written)
}

fn write_str16(out: &mut Vec<u8>, value: &str) -> io::Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
    out.write_u16::<LittleEndian>(len)?;
    out.write_all(value.as_bytes())
}

fn write_str32(out: &mut Vec<u8>, value: &str) -> io::Result<()> {
    write_bytes32(out, value.as_bytes())
}

fn write_bytes32(out: &mut Vec<u8>, value: &[u8]) -> io::Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too long"))?;
    out.write_u32::<LittleEndian>(len)?;
    out.write_all(value)
}

fn write_path(out: &mut Vec<u8>, path: &Path) -> io::Result<()> {
    write_bytes32(out, path.as_os_str().as_bytes())
}

fn encode_metadata(metadata: &ImageMetadata) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_str32(&mut out, &metadata.program)?;
    out.write_u32::<LittleEndian>(metadata.warnings.len() as u32)?;
    for warning in &metadata.warnings {
        write_str32(&mut out, warning)?;
    }
    Ok(out)
}

fn encode_memory(regions: &[MemoryRegion]) -> io::Result<Vec<u8>> {
    let total: usize = regions.iter().map(|r| r.contents.len() + 64).sum();
    let mut out = Vec::with_capacity(total + 4);
    out.write_u32::<LittleEndian>(regions.len() as u32)?;
    for region in regions {
        out.write_u64::<LittleEndian>(region.start)?;
        out.write_u64::<LittleEndian>(region.length)?;
        out.write_u8(region.permissions.bits())?;
        match &region.kind {
            RegionKind::Anonymous { name } => {
                out.write_u8(1)?;
                write_str32(&mut out, name.as_deref().unwrap_or(""))?;
            }
            RegionKind::File { path, offset } => {
                out.write_u8(2)?;
                write_path(&mut out, path)?;
                out.write_u64::<LittleEndian>(*offset)?;
            }
            RegionKind::Guard => out.write_u8(3)?,
        }
        out.write_u64::<LittleEndian>(region.contents.len() as u64)?;
        out.write_all(&region.contents)?;
    }
    Ok(out)
}

fn encode_registers(out: &mut Vec<u8>, regs: &RegisterFile) -> io::Result<()> {
    out.write_u16::<LittleEndian>(GPR_COUNT as u16)?;
    for value in regs.gprs {
        out.write_u64::<LittleEndian>(value)?;
    }
    out.write_u64::<LittleEndian>(regs.rip)?;
    out.write_u64::<LittleEndian>(regs.rflags)?;
    out.write_u64::<LittleEndian>(regs.fs_base)?;
    out.write_u64::<LittleEndian>(regs.gs_base)?;
    write_bytes32(out, &regs.extended)
}

fn encode_execution(execution: &ExecutionState) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(execution.threads.len() as u32)?;
    for thread in &execution.threads {
        out.write_u32::<LittleEndian>(thread.thread_id)?;
        out.write_u8(u8::from(thread.continuation))?;
        out.write_u64::<LittleEndian>(thread.pending_signals.bits())?;
        out.write_u64::<LittleEndian>(thread.blocked_signals.bits())?;
        encode_registers(&mut out, &thread.registers)?;
    }
    Ok(out)
}

fn encode_descriptors(table: &DescriptorTable) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(table.len() as u32)?;
    for (fd, entry) in table.iter() {
        out.write_i32::<LittleEndian>(fd.value())?;
        out.write_i32::<LittleEndian>(entry.flags)?;
        out.write_u8(u8::from(entry.required))?;
        match &entry.kind {
            DescriptorKind::File { path, offset } => {
                out.write_u8(1)?;
                write_path(&mut out, path)?;
                out.write_u64::<LittleEndian>(*offset)?;
            }
            DescriptorKind::Directory { path } => {
                out.write_u8(2)?;
                write_path(&mut out, path)?;
            }
            DescriptorKind::CharDevice { path } => {
                out.write_u8(3)?;
                write_path(&mut out, path)?;
            }
            DescriptorKind::Pipe { end, peer } => {
                out.write_u8(4)?;
                out.write_u8(match end {
                    PipeEnd::Read => 0,
                    PipeEnd::Write => 1,
                })?;
                out.write_i32::<LittleEndian>(peer.map_or(-1, |p| p.value()))?;
            }
            DescriptorKind::Listener { endpoint } => {
                out.write_u8(5)?;
                match endpoint {
                    Endpoint::Tcp(addr) => {
                        out.write_u8(1)?;
                        write_str32(&mut out, &addr.to_string())?;
                    }
                    Endpoint::Unix(path) => {
                        out.write_u8(2)?;
                        write_path(&mut out, path)?;
                    }
                }
            }
            DescriptorKind::Closed { was, reason } => {
                out.write_u8(6)?;
                write_str32(&mut out, was)?;
                write_str32(&mut out, reason)?;
            }
        }
    }
    Ok(out)
}

fn encode_signals(signals: &BTreeMap<i32, SignalDisposition>) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + signals.len() * 36);
    out.write_u32::<LittleEndian>(signals.len() as u32)?;
    for (signo, disposition) in signals {
        out.write_i32::<LittleEndian>(*signo)?;
        out.write_u64::<LittleEndian>(disposition.handler)?;
        out.write_u64::<LittleEndian>(disposition.flags)?;
        out.write_u64::<LittleEndian>(disposition.mask.bits())?;
        out.write_u64::<LittleEndian>(disposition.restorer)?;
    }
    Ok(out)
}

// =========================================================================
// Decoding
// =========================================================================

/// Decode the header, leaving `input` positioned at the first section.
/// Returns the header and the number of sections that follow.
pub fn decode_header<R: Read>(input: &mut R) -> Result<(ImageHeader, u32), SnapshotError> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).map_err(truncated)?;
    if magic != IMAGE_MAGIC {
        return Err(incompatible("not a snapshot image (bad magic)"));
    }

    let version = input.read_u16::<LittleEndian>().map_err(truncated)?;
    if version != FORMAT_VERSION {
        return Err(incompatible(format!(
            "unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    let arch_code = input.read_u16::<LittleEndian>().map_err(truncated)?;
    let arch = Arch::from_code(arch_code)
        .ok_or_else(|| incompatible(format!("unknown architecture code {}", arch_code)))?;

    let flags = input.read_u32::<LittleEndian>().map_err(truncated)?;
    let created_at_us = input.read_u64::<LittleEndian>().map_err(truncated)?;

    let label_len = input.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let label = read_string(input, label_len)?;
    let label = SnapshotLabel::new(label)
        .map_err(|e| incompatible(format!("invalid label in header: {}", e)))?;

    let description_len = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let description = read_string(input, description_len)?;

    let section_count = input.read_u32::<LittleEndian>().map_err(truncated)?;

    Ok((
        ImageHeader {
            version,
            arch,
            label,
            description,
            created_at_us,
            live: flags & FLAG_LIVE != 0,
        },
        section_count,
    ))
}

/// Decode a complete image and check its invariants.
pub fn decode<R: Read>(input: &mut R) -> Result<SnapshotImage, SnapshotError> {
    let (header, section_count) = decode_header(input)?;

    let mut metadata = None;
    let mut memory = None;
    let mut execution = None;
    let mut descriptors = None;
    let mut signals = None;

    for _ in 0..section_count {
        let tag = input.read_u32::<LittleEndian>().map_err(truncated)?;
        let length = input.read_u64::<LittleEndian>().map_err(truncated)?;
        let crc = input.read_u32::<LittleEndian>().map_err(truncated)?;

        let mut payload = Vec::new();
        input
            .by_ref()
            .take(length)
            .read_to_end(&mut payload)
            .map_err(truncated)?;
        if payload.len() as u64 != length {
            return Err(incompatible(format!(
                "section {} truncated: {} of {} bytes",
                tag,
                payload.len(),
                length
            )));
        }
        if crc32fast::hash(&payload) != crc {
            return Err(incompatible(format!("section {} failed checksum", tag)));
        }

        let mut cursor = Cursor::new(payload.as_slice());
        match tag {
            TAG_METADATA => set_once(&mut metadata, tag, decode_metadata(&mut cursor)?)?,
            TAG_MEMORY => set_once(&mut memory, tag, decode_memory(&mut cursor)?)?,
            TAG_EXECUTION => set_once(&mut execution, tag, decode_execution(&mut cursor)?)?,
            TAG_DESCRIPTORS => set_once(&mut descriptors, tag, decode_descriptors(&mut cursor)?)?,
            TAG_SIGNALS => set_once(&mut signals, tag, decode_signals(&mut cursor)?)?,
            unknown => {
                tracing::debug!(tag = unknown, length, "Skipping unknown image section");
                continue;
            }
        }
        if cursor.position() != length {
            return Err(incompatible(format!(
                "section {} has {} trailing bytes",
                tag,
                length - cursor.position()
            )));
        }
    }

    let image = SnapshotImage {
        header,
        metadata: metadata.unwrap_or_default(),
        memory: memory.ok_or_else(|| incompatible("missing memory section"))?,
        execution: execution.ok_or_else(|| incompatible("missing execution section"))?,
        descriptors: descriptors.ok_or_else(|| incompatible("missing descriptor section"))?,
        signals: signals.unwrap_or_default(),
    };
    image.validate()?;
    Ok(image)
}

fn set_once<T>(slot: &mut Option<T>, tag: u32, value: T) -> Result<(), SnapshotError> {
    if slot.is_some() {
        return Err(incompatible(format!("section {} appears twice", tag)));
    }
    *slot = Some(value);
    Ok(())
}

fn read_bytes<R: Read>(input: &mut R, len: usize) -> Result<Vec<u8>, SnapshotError> {
    if len > MAX_STRING_LEN {
        return Err(incompatible(format!("field length {} exceeds limit", len)));
    }
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn read_string<R: Read>(input: &mut R, len: usize) -> Result<String, SnapshotError> {
    String::from_utf8(read_bytes(input, len)?).map_err(|_| incompatible("string is not UTF-8"))
}

fn read_str32<R: Read>(input: &mut R) -> Result<String, SnapshotError> {
    let len = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    read_string(input, len)
}

fn read_path<R: Read>(input: &mut R) -> Result<PathBuf, SnapshotError> {
    let len = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let bytes = read_bytes(input, len)?;
    Ok(PathBuf::from(OsStr::from_bytes(&bytes)))
}

fn remaining(cursor: &Cursor<&[u8]>) -> u64 {
    (cursor.get_ref().len() as u64).saturating_sub(cursor.position())
}

fn decode_metadata(cursor: &mut Cursor<&[u8]>) -> Result<ImageMetadata, SnapshotError> {
    let program = read_str32(cursor)?;
    let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut warnings = Vec::new();
    for _ in 0..count {
        warnings.push(read_str32(cursor)?);
    }
    Ok(ImageMetadata { program, warnings })
}

fn decode_memory(cursor: &mut Cursor<&[u8]>) -> Result<Vec<MemoryRegion>, SnapshotError> {
    let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut regions = Vec::new();
    for _ in 0..count {
        let start = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let length = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let permissions = Protection::from_bits(cursor.read_u8().map_err(truncated)?);
        let kind = match cursor.read_u8().map_err(truncated)? {
            1 => {
                let name = read_str32(cursor)?;
                RegionKind::Anonymous {
                    name: (!name.is_empty()).then_some(name),
                }
            }
            2 => {
                let path = read_path(cursor)?;
                let offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                RegionKind::File { path, offset }
            }
            3 => RegionKind::Guard,
            other => return Err(incompatible(format!("unknown region kind {}", other))),
        };

        let content_len = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        if content_len > remaining(cursor) {
            return Err(incompatible(format!(
                "region {:#x} contents run past the section",
                start
            )));
        }
        let mut contents = vec![0u8; content_len as usize];
        cursor.read_exact(&mut contents).map_err(truncated)?;

        regions.push(MemoryRegion {
            start,
            length,
            permissions,
            kind,
            contents,
        });
    }
    Ok(regions)
}

fn decode_registers(cursor: &mut Cursor<&[u8]>) -> Result<RegisterFile, SnapshotError> {
    let count = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    if count != GPR_COUNT {
        return Err(incompatible(format!(
            "register file has {} general registers, expected {}",
            count, GPR_COUNT
        )));
    }
    let mut regs = RegisterFile::default();
    for value in regs.gprs.iter_mut() {
        *value = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    }
    regs.rip = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    regs.rflags = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    regs.fs_base = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    regs.gs_base = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    let extended_len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    regs.extended = read_bytes(cursor, extended_len)?;
    Ok(regs)
}

fn decode_execution(cursor: &mut Cursor<&[u8]>) -> Result<ExecutionState, SnapshotError> {
    let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut threads = Vec::new();
    for _ in 0..count {
        let thread_id = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let continuation = cursor.read_u8().map_err(truncated)? != 0;
        let pending = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let blocked = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let registers = decode_registers(cursor)?;
        threads.push(ThreadState {
            thread_id,
            registers,
            pending_signals: SigSet::from_bits(pending),
            blocked_signals: SigSet::from_bits(blocked),
            continuation,
        });
    }
    Ok(ExecutionState { threads })
}

fn decode_fd(raw: i32) -> Result<GuestFd, SnapshotError> {
    GuestFd::new(raw).map_err(|_| incompatible(format!("invalid descriptor number {}", raw)))
}

fn decode_descriptors(cursor: &mut Cursor<&[u8]>) -> Result<DescriptorTable, SnapshotError> {
    let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut table = DescriptorTable::new();
    for _ in 0..count {
        let fd = decode_fd(cursor.read_i32::<LittleEndian>().map_err(truncated)?)?;
        let flags = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
        let required = cursor.read_u8().map_err(truncated)? != 0;
        let kind = match cursor.read_u8().map_err(truncated)? {
            1 => {
                let path = read_path(cursor)?;
                let offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                DescriptorKind::File { path, offset }
            }
            2 => DescriptorKind::Directory {
                path: read_path(cursor)?,
            },
            3 => DescriptorKind::CharDevice {
                path: read_path(cursor)?,
            },
            4 => {
                let end = match cursor.read_u8().map_err(truncated)? {
                    0 => PipeEnd::Read,
                    1 => PipeEnd::Write,
                    other => return Err(incompatible(format!("unknown pipe end {}", other))),
                };
                let peer = match cursor.read_i32::<LittleEndian>().map_err(truncated)? {
                    -1 => None,
                    raw => Some(decode_fd(raw)?),
                };
                DescriptorKind::Pipe { end, peer }
            }
            5 => {
                let endpoint = match cursor.read_u8().map_err(truncated)? {
                    1 => {
                        let text = read_str32(cursor)?;
                        Endpoint::Tcp(text.parse().map_err(|_| {
                            incompatible(format!("invalid socket address '{}'", text))
                        })?)
                    }
                    2 => Endpoint::Unix(read_path(cursor)?),
                    other => {
                        return Err(incompatible(format!("unknown endpoint kind {}", other)))
                    }
                };
                DescriptorKind::Listener { endpoint }
            }
            6 => DescriptorKind::Closed {
                was: read_str32(cursor)?,
                reason: read_str32(cursor)?,
            },
            other => return Err(incompatible(format!("unknown descriptor kind {}", other))),
        };
        table.insert(
            fd,
            DescriptorEntry {
                kind,
                flags,
                required,
            },
        )?;
    }
    Ok(table)
}

fn decode_signals(
    cursor: &mut Cursor<&[u8]>,
) -> Result<BTreeMap<i32, SignalDisposition>, SnapshotError> {
    let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut signals = BTreeMap::new();
    for _ in 0..count {
        let signo = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
        let disposition = SignalDisposition {
            handler: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            flags: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            mask: SigSet::from_bits(cursor.read_u64::<LittleEndian>().map_err(truncated)?),
            restorer: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
        };
        if signals.insert(signo, disposition).is_some() {
            return Err(incompatible(format!("signal {} recorded twice", signo)));
        }
    }
    Ok(signals)
}
