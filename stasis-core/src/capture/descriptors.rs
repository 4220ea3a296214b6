// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Descriptor capture.
//!
//! Each open guest descriptor is classified from the host's view of it.
//! Regular files, directories, character devices, empty pipes and listening
//! stream sockets can be reconstructed; anything else is either fatal
//! (strict mode) or recorded as closed with a warning.

use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{getsockname, getsockopt, sockopt, SockType, SockaddrLike, SockaddrStorage};
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::{lseek, Whence};

use crate::error::SnapshotError;
use crate::guest::fdtable::FdTable;
use crate::image::{DescriptorEntry, DescriptorKind, DescriptorTable, Endpoint, PipeEnd};
use crate::types::GuestFd;

const DELETED_SUFFIX: &str = " (deleted)";

/// Result of descriptor capture.
#[derive(Debug, Default)]
pub struct DescriptorCapture {
    pub table: DescriptorTable,
    /// One line per descriptor dropped in non-strict mode.
    pub warnings: Vec<String>,
}

/// Host view of one descriptor before pipe pairing.
struct Classified {
    fd: GuestFd,
    flags: i32,
    required: bool,
    kind: Kind,
}

enum Kind {
    Restorable(DescriptorKind),
    Pipe { end: PipeEnd, inode: (u64, u64) },
    Unrestorable { was: &'static str, reason: String },
}

fn capture_failed(fd: GuestFd, what: &str, e: impl std::fmt::Display) -> SnapshotError {
    SnapshotError::CaptureFailed {
        reason: format!("descriptor {}: {}: {}", fd, what, e),
    }
}

/// Classify every open descriptor of a quiesced guest.
pub fn capture(fds: &FdTable, strict: bool) -> Result<DescriptorCapture, SnapshotError> {
    let classified = fds.inspect(|fd, host, required| classify(fd, host, required))?;
    let classified = pair_pipes(classified);

    let mut out = DescriptorCapture::default();
    for (fd, flags, required, kind) in classified {
        let kind = match kind {
            Ok(kind) => kind,
            Err((was, reason)) if strict => {
                tracing::warn!(fd = %fd, was, reason = %reason, "Unrestorable descriptor");
                return Err(SnapshotError::UnsupportedResource {
                    fd,
                    reason: format!("{}: {}", was, reason),
                });
            }
            Err((was, reason)) => {
                let warning = format!("descriptor {} ({}) will be closed on restart: {}", fd, was, reason);
                tracing::warn!(fd = %fd, was, reason = %reason, "Descriptor dropped from snapshot");
                out.warnings.push(warning);
                DescriptorKind::Closed {
                    was: was.to_string(),
                    reason,
                }
            }
        };
        out.table.insert(
            fd,
            DescriptorEntry {
                kind,
                flags,
                required,
            },
        )?;
    }

    tracing::debug!(
        descriptors = out.table.len(),
        dropped = out.warnings.len(),
        "Captured descriptors"
    );

    Ok(out)
}

fn classify(fd: GuestFd, host: BorrowedFd<'_>, required: bool) -> Result<Classified, SnapshotError> {
    let raw = host.as_raw_fd();
    let stat = fstat(raw).map_err(|e| capture_failed(fd, "fstat", e))?;
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(|e| capture_failed(fd, "fcntl", e))?;
    let file_type = SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT;

    let kind = if file_type == SFlag::S_IFREG {
        let path = host_path(fd, raw)?;
        match path {
            Err(reason) => Kind::Unrestorable { was: "file", reason },
            Ok(path) => {
                let offset =
                    lseek(raw, 0, Whence::SeekCur).map_err(|e| capture_failed(fd, "lseek", e))?;
                Kind::Restorable(DescriptorKind::File {
                    path,
                    offset: offset as u64,
                })
            }
        }
    } else if file_type == SFlag::S_IFDIR {
        match host_path(fd, raw)? {
            Ok(path) => Kind::Restorable(DescriptorKind::Directory { path }),
            Err(reason) => Kind::Unrestorable {
                was: "directory",
                reason,
            },
        }
    } else if file_type == SFlag::S_IFCHR {
        match host_path(fd, raw)? {
            Ok(path) => Kind::Restorable(DescriptorKind::CharDevice { path }),
            Err(reason) => Kind::Unrestorable {
                was: "char_device",
                reason,
            },
        }
    } else if file_type == SFlag::S_IFIFO {
        let unread = unread_bytes(raw).map_err(|e| capture_failed(fd, "FIONREAD", e))?;
        if unread > 0 {
            Kind::Unrestorable {
                was: "pipe",
                reason: format!("pipe holds {} unread bytes", unread),
            }
        } else {
            let access = OFlag::from_bits_truncate(flags) & OFlag::O_ACCMODE;
            let end = if access == OFlag::O_WRONLY {
                PipeEnd::Write
            } else {
                PipeEnd::Read
            };
            Kind::Pipe {
                end,
                inode: (stat.st_dev as u64, stat.st_ino as u64),
            }
        }
    } else if file_type == SFlag::S_IFSOCK {
        classify_socket(fd, host)?
    } else {
        Kind::Unrestorable {
            was: "unknown",
            reason: format!("unsupported file type {:#o}", file_type.bits()),
        }
    };

    Ok(Classified {
        fd,
        flags,
        required,
        kind,
    })
}

/// Path the host descriptor refers to, or why it has none usable.
fn host_path(fd: GuestFd, raw: RawFd) -> Result<Result<PathBuf, String>, SnapshotError> {
    let link = std::fs::read_link(format!("/proc/self/fd/{}", raw))
        .map_err(|e| capture_failed(fd, "readlink", e))?;
    let text = link.to_string_lossy();
    if text.ends_with(DELETED_SUFFIX) {
        return Ok(Err("backing file was unlinked".to_string()));
    }
    if !link.is_absolute() {
        return Ok(Err(format!("no filesystem path ({})", text)));
    }
    Ok(Ok(link))
}

fn unread_bytes(raw: RawFd) -> std::io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the pointer
    let rc = unsafe { libc::ioctl(raw, libc::FIONREAD, &mut count as *mut libc::c_int) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}

fn classify_socket(fd: GuestFd, host: BorrowedFd<'_>) -> Result<Kind, SnapshotError> {
    let sock_type = getsockopt(&host, sockopt::SockType).map_err(|e| capture_failed(fd, "SO_TYPE", e))?;
    if sock_type != SockType::Stream {
        return Ok(Kind::Unrestorable {
            was: "socket",
            reason: format!("{:?} sockets are not supported", sock_type),
        });
    }

    let listening =
        getsockopt(&host, sockopt::AcceptConn).map_err(|e| capture_failed(fd, "SO_ACCEPTCONN", e))?;
    if !listening {
        return Ok(Kind::Unrestorable {
            was: "socket",
            reason: "connected or unbound stream state cannot be reconstructed".to_string(),
        });
    }

    let addr: SockaddrStorage =
        getsockname(host.as_raw_fd()).map_err(|e| capture_failed(fd, "getsockname", e))?;

    let endpoint = if let Some(v4) = addr.as_sockaddr_in() {
        Some(Endpoint::Tcp(SocketAddr::V4(SocketAddrV4::from(*v4))))
    } else if let Some(v6) = addr.as_sockaddr_in6() {
        Some(Endpoint::Tcp(SocketAddr::V6(SocketAddrV6::from(*v6))))
    } else {
        addr.as_unix_addr()
            .and_then(|unix| unix.path())
            .map(|path| Endpoint::Unix(path.to_path_buf()))
    };

    Ok(match endpoint {
        Some(endpoint) => Kind::Restorable(DescriptorKind::Listener { endpoint }),
        None => Kind::Unrestorable {
            was: "socket",
            reason: format!(
                "listening on an address that cannot be rebound (family {:?})",
                addr.family()
            ),
        },
    })
}

type Row = (GuestFd, i32, bool, Result<DescriptorKind, (&'static str, String)>);

fn pipes_by_inode(classified: &[Classified]) -> BTreeMap<(u64, u64), Vec<(GuestFd, PipeEnd)>> {
    let mut pipes: BTreeMap<(u64, u64), Vec<(GuestFd, PipeEnd)>> = BTreeMap::new();
    for c in classified {
        if let Kind::Pipe { end, inode } = &c.kind {
            pipes.entry(*inode).or_default().push((c.fd, *end));
        }
    }
    pipes
}

/// Link read and write ends of the same pipe. A pipe end held by more than
/// one guest descriptor cannot be reproduced and is unrestorable.
fn pair_pipes(classified: Vec<Classified>) -> Vec<Row> {
    let pipes = pipes_by_inode(&classified);

    classified
        .into_iter()
        .map(|c| {
            let kind = match c.kind {
                Kind::Restorable(kind) => Ok(kind),
                Kind::Unrestorable { was, reason } => Err((was, reason)),
                Kind::Pipe { end, inode } => {
                    let ends = pipes.get(&inode).map(Vec::as_slice).unwrap_or_default();
                    let same_end = ends.iter().filter(|(_, e)| *e == end).count();
                    let peers: Vec<GuestFd> = ends
                        .iter()
                        .filter(|(_, e)| *e != end)
                        .map(|(fd, _)| *fd)
                        .collect();
                    if same_end > 1 || peers.len() > 1 {
                        Err((
                            "pipe",
                            "pipe end is shared by several guest descriptors".to_string(),
                        ))
                    } else {
                        Ok(DescriptorKind::Pipe {
                            end,
                            peer: peers.first().copied(),
                        })
                    }
                }
            };
            (c.fd, c.flags, c.required, kind)
        })
        .collect()
}
