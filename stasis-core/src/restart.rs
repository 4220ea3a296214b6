// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Restart loader: rebuilds a running guest from an image.
//!
//! Phases follow [`RestartStateMachine`]: the image is loaded, validated
//! against this host and program, reconstructed (memory, signals,
//! descriptors, vCPUs) and finally resumed. Any failure before resuming
//! aborts the restart with nothing left running.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{lseek, Whence};

use crate::config::SnapshotConfig;
use crate::error::SnapshotError;
use crate::guest::vcpu::VcpuSlot;
use crate::guest::{Guest, GuestProgram};
use crate::image::{
    Arch, DescriptorEntry, DescriptorKind, Endpoint, ImageReader, MemoryRegion, PipeEnd,
    SnapshotImage,
};
use crate::state::{RestartPhase, RestartStateMachine};
use crate::types::{GuestFd, SnapshotLabel, VcpuId};

/// What a restart reconstructed and what it had to leave out.
#[derive(Debug, Clone)]
pub struct RestartReport {
    pub image: PathBuf,
    pub label: SnapshotLabel,
    pub threads: usize,
    pub regions: usize,
    pub memory_bytes: u64,
    /// Descriptors recorded as closed at capture time.
    pub closed: Vec<GuestFd>,
    /// Optional descriptors whose resource could not be reacquired.
    pub unavailable: Vec<(GuestFd, String)>,
    pub elapsed: Duration,
}

/// A restarted, running guest.
#[derive(Debug)]
pub struct RestartedGuest {
    pub guest: Guest,
    pub report: RestartReport,
}

/// Restarts guests from images.
#[derive(Debug, Clone)]
pub struct RestartLoader {
    config: SnapshotConfig,
}

impl RestartLoader {
    /// The restarted guest runs with `config`.
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    /// Restart the image stored under `label` in the configured directory.
    pub fn restart_label(
        &self,
        label: &str,
        program: Arc<dyn GuestProgram>,
    ) -> Result<RestartedGuest, SnapshotError> {
        let label = SnapshotLabel::new(label)?;
        self.restart(self.config.directory.join(label.file_name()), program)
    }

    /// Restart the image at `path` with `program` as the guest code.
    pub fn restart(
        &self,
        path: impl AsRef<Path>,
        program: Arc<dyn GuestProgram>,
    ) -> Result<RestartedGuest, SnapshotError> {
        let path = path.as_ref();
        let mut machine = RestartStateMachine::new(path.display().to_string());

        match self.run(&mut machine, path, program) {
            Ok(restarted) => {
                tracing::info!(
                    image = %path.display(),
                    label = %restarted.report.label,
                    threads = restarted.report.threads,
                    memory_bytes = restarted.report.memory_bytes,
                    closed = restarted.report.closed.len(),
                    unavailable = restarted.report.unavailable.len(),
                    elapsed_ms = restarted.report.elapsed.as_millis() as u64,
                    "Guest restarted"
                );
                Ok(restarted)
            }
            Err(e) => {
                let phase = machine.phase();
                machine.fail();
                tracing::error!(image = %path.display(), phase = %phase, error = %e, "Restart failed");
                Err(e)
            }
        }
    }

    fn run(
        &self,
        machine: &mut RestartStateMachine,
        path: &Path,
        program: Arc<dyn GuestProgram>,
    ) -> Result<RestartedGuest, SnapshotError> {
        let started = Instant::now();
        let advance = |machine: &mut RestartStateMachine, phase: RestartPhase| {
            machine
                .transition_to(phase)
                .map_err(|e| SnapshotError::ReconstructFailed {
                    reason: e.to_string(),
                })
        };

        let image = ImageReader::open(path)?;
        advance(machine, RestartPhase::Validating)?;

        Self::check_compatible(&image, program.as_ref())?;
        advance(machine, RestartPhase::Reconstructing)?;

        let guest = Guest::new(program, self.config.clone());
        restore_memory(&guest, &image.memory, self.config.capture_workers)?;
        guest
            .signals()
            .replace_all(&image.signals)
            .map_err(|e| SnapshotError::ReconstructFailed {
                reason: format!("signal dispositions: {}", e),
            })?;
        let (closed, unavailable) = restore_descriptors(&guest, &image)?;

        let inner = guest.inner();
        let mut slots = Vec::with_capacity(image.execution.threads.len());
        for thread in &image.execution.threads {
            let id = VcpuId::new(thread.thread_id);
            let slot = Arc::new(VcpuSlot::new(
                thread.registers.clone(),
                thread.pending_signals,
                thread.blocked_signals,
            ));
            inner.install_vcpu(id, Arc::clone(&slot));
            slots.push((id, slot));
        }

        advance(machine, RestartPhase::Resuming)?;
        for (id, slot) in slots {
            inner
                .start_vcpu(id, slot)
                .map_err(|e| SnapshotError::ReconstructFailed {
                    reason: format!("starting {}: {}", id, e),
                })?;
        }

        let report = RestartReport {
            image: path.to_path_buf(),
            label: image.header.label.clone(),
            threads: image.execution.threads.len(),
            regions: image.memory.len(),
            memory_bytes: image.memory_bytes(),
            closed,
            unavailable,
            elapsed: started.elapsed(),
        };

        Ok(RestartedGuest { guest, report })
    }

    fn check_compatible(image: &SnapshotImage, program: &dyn GuestProgram) -> Result<(), SnapshotError> {
        if image.header.arch != Arch::host() {
            return Err(SnapshotError::IncompatibleFormat {
                reason: format!(
                    "image was taken on {:?}, this host is {:?}",
                    image.header.arch,
                    Arch::host()
                ),
            });
        }
        if image.metadata.program != program.name() {
            return Err(SnapshotError::IncompatibleFormat {
                reason: format!(
                    "image was taken from program '{}', cannot resume it as '{}'",
                    image.metadata.program,
                    program.name()
                ),
            });
        }
        Ok(())
    }
}

/// Map every region at its original address and copy its bytes back,
/// splitting the copy across up to `workers` threads.
fn restore_memory(guest: &Guest, regions: &[MemoryRegion], workers: usize) -> Result<(), SnapshotError> {
    let memory = guest.memory();
    for region in regions {
        memory
            .map_recorded(region)
            .map_err(|e| SnapshotError::ReconstructFailed {
                reason: format!("mapping region {:#x}: {}", region.start, e),
            })?;
    }

    let mapped = memory.regions();
    let mut targets = Vec::with_capacity(regions.len());
    for region in regions {
        let target = mapped
            .get(&region.start)
            .ok_or_else(|| SnapshotError::ReconstructFailed {
                reason: format!("region {:#x} vanished during restore", region.start),
            })?;
        // SAFETY: no vCPU has started yet and each region is visited once
        let bytes = unsafe { target.contents_mut() };
        if bytes.len() != region.contents.len() {
            return Err(SnapshotError::ReconstructFailed {
                reason: format!("region {:#x} size mismatch", region.start),
            });
        }
        targets.push((bytes, region.contents.as_slice()));
    }

    let per_worker = targets.len().div_ceil(workers.max(1)).max(1);
    thread::scope(|scope| {
        for chunk in targets.chunks_mut(per_worker) {
            scope.spawn(move || {
                for (dst, src) in chunk.iter_mut() {
                    dst.copy_from_slice(src);
                }
            });
        }
    });

    Ok(())
}

fn unavailable(fd: GuestFd, reason: impl std::fmt::Display) -> SnapshotError {
    SnapshotError::ResourceUnavailable {
        fd,
        reason: reason.to_string(),
    }
}

/// Reopen every recorded descriptor at its original number. Returns the
/// descriptors that were recorded closed and the optional ones that could not
/// be reacquired.
fn restore_descriptors(
    guest: &Guest,
    image: &SnapshotImage,
) -> Result<(Vec<GuestFd>, Vec<(GuestFd, String)>), SnapshotError> {
    let mut closed = Vec::new();
    let mut missing = Vec::new();
    // Second ends of pipes created when their peer was restored
    let mut pipe_peers: HashMap<GuestFd, OwnedFd> = HashMap::new();

    for (fd, entry) in image.descriptors.iter() {
        let reopened = match &entry.kind {
            DescriptorKind::Closed { .. } => {
                closed.push(fd);
                continue;
            }
            DescriptorKind::Pipe { peer, end } => match pipe_peers.remove(&fd) {
                Some(host) => Ok(host),
                None => reopen_pipe(fd, *end, *peer, &mut pipe_peers),
            }
            .and_then(|host| set_nonblocking(fd, host, entry.flags)),
            _ => reopen(fd, entry),
        };

        match reopened {
            Ok(host) => guest
                .fds()
                .install_at(fd, host, entry.required)
                .map_err(|e| SnapshotError::ReconstructFailed {
                    reason: format!("installing descriptor {}: {}", fd, e),
                })?,
            Err(e) if entry.required => return Err(e),
            Err(e) => {
                tracing::warn!(fd = %fd, error = %e, "Optional descriptor not restored");
                missing.push((fd, e.to_string()));
            }
        }
    }

    Ok((closed, missing))
}

fn reopen(fd: GuestFd, entry: &DescriptorEntry) -> Result<OwnedFd, SnapshotError> {
    let flags = OFlag::from_bits_truncate(entry.flags)
        & !(OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_EXCL);

    match &entry.kind {
        DescriptorKind::File { path, offset } => {
            let host = open_path(fd, path, flags)?;
            if !flags.contains(OFlag::O_APPEND) {
                let offset = i64::try_from(*offset).map_err(|e| unavailable(fd, e))?;
                lseek(host.as_raw_fd(), offset, Whence::SeekSet).map_err(|e| unavailable(fd, e))?;
            }
            Ok(host)
        }
        DescriptorKind::Directory { path } | DescriptorKind::CharDevice { path } => {
            open_path(fd, path, flags)
        }
        DescriptorKind::Listener { endpoint } => {
            rebind(fd, endpoint).and_then(|host| set_nonblocking(fd, host, entry.flags))
        }
        DescriptorKind::Pipe { .. } | DescriptorKind::Closed { .. } => Err(unavailable(
            fd,
            format!("{} descriptors are not reopened by path", entry.kind.type_name()),
        )),
    }
}

fn open_path(fd: GuestFd, path: &Path, flags: OFlag) -> Result<OwnedFd, SnapshotError> {
    let raw = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| unavailable(fd, format!("{}: {}", path.display(), e)))?;
    // SAFETY: open returned a fresh descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Create a fresh pipe for `fd`, parking the other end for `peer`.
fn reopen_pipe(
    fd: GuestFd,
    end: PipeEnd,
    peer: Option<GuestFd>,
    pipe_peers: &mut HashMap<GuestFd, OwnedFd>,
) -> Result<OwnedFd, SnapshotError> {
    let (read, write) = nix::unistd::pipe().map_err(|e| unavailable(fd, e))?;
    let (mine, theirs) = match end {
        PipeEnd::Read => (read, write),
        PipeEnd::Write => (write, read),
    };

    if let Some(peer) = peer {
        pipe_peers.insert(peer, theirs);
    }
    Ok(mine)
}

fn set_nonblocking(fd: GuestFd, host: OwnedFd, flags: i32) -> Result<OwnedFd, SnapshotError> {
    if OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK) {
        fcntl(host.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| unavailable(fd, e))?;
    }
    Ok(host)
}

fn rebind(fd: GuestFd, endpoint: &Endpoint) -> Result<OwnedFd, SnapshotError> {
    let host = match endpoint {
        Endpoint::Tcp(addr) => TcpListener::bind(addr)
            .map(OwnedFd::from)
            .map_err(|e| unavailable(fd, format!("bind {}: {}", endpoint, e)))?,
        Endpoint::Unix(path) => bind_unix(path)
            .map(OwnedFd::from)
            .map_err(|e| unavailable(fd, format!("bind {}: {}", endpoint, e)))?,
    };
    Ok(host)
}

/// Bind a Unix listener, replacing a stale socket file left by the
/// snapshotted process.
fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            use std::os::unix::fs::FileTypeExt;
            if std::fs::symlink_metadata(path)?.file_type().is_socket() {
                std::fs::remove_file(path)?;
                UnixListener::bind(path)
            } else {
                Err(e)
            }
        }
        other => other,
    }
}
