// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end snapshot and restart tests.
//!
//! These tests run small guest programs on real vCPU threads, snapshot them
//! from inside the guest and from the host, and restart them from the image.

use std::fs::{self, OpenOptions};
use std::net::{TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Whence;
use stasis_core::guest::{Gpr, SigSet, SignalDisposition};
use stasis_core::image::DescriptorKind;
use stasis_core::{
    Guest, GuestExit, GuestProgram, ImageReader, Protection, RegisterFile,
    RestartLoader, SnapshotConfig, SnapshotError, Step, VcpuContext,
};
use tempfile::TempDir;

const INIT: u64 = 0x1000;
const LOOP: u64 = 0x1001;
const TAKE: u64 = 0x1002;
const AFTER: u64 = 0x1003;

/// Counter at +0, take status at +8.
const DATA: u64 = 0x10_0000;
/// Resumed rip at +0, rax at +8.
const RESULT: u64 = 0x20_0000;
const GUARD: u64 = 0x30_0000;
const STACK: u64 = 0x7fff_0000;

const PAGE: u64 = 4096;
const LABEL: &str = "test_snap";

/// Counts to five, snapshots itself, then exits with the count.
struct Counter;

impl GuestProgram for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn step(&self, ctx: &mut VcpuContext<'_>) -> Step {
        match ctx.regs().rip {
            INIT => {
                ctx.memory().write_u64(DATA, 0).unwrap();
                let usr2 = SigSet::single(12).unwrap();
                ctx.block(usr2);
                ctx.raise(12).unwrap();
                ctx.regs_mut().rip = LOOP;
            }
            LOOP => {
                let count = ctx.memory().read_u64(DATA).unwrap() + 1;
                ctx.memory().write_u64(DATA, count).unwrap();
                if count == 5 {
                    ctx.regs_mut().rip = TAKE;
                }
            }
            TAKE => {
                let status = ctx.take(LABEL, "counter reached five");
                ctx.memory()
                    .write_u64(DATA + 8, status as i64 as u64)
                    .unwrap();
            }
            AFTER => {
                let rip = ctx.regs().rip;
                let rax = ctx.regs().get(Gpr::Rax);
                ctx.memory().write_u64(RESULT, rip).unwrap();
                ctx.memory().write_u64(RESULT + 8, rax).unwrap();
                let count = ctx.memory().read_u64(DATA).unwrap();
                return Step::ExitGroup(count as i32);
            }
            _ => return Step::ExitGroup(-1),
        }
        Step::Continue
    }
}

/// Bumps a counter at `DATA` every `pause`.
struct Idle {
    pause: Duration,
}

impl GuestProgram for Idle {
    fn name(&self) -> &str {
        "idle"
    }

    fn step(&self, ctx: &mut VcpuContext<'_>) -> Step {
        if let Ok(count) = ctx.memory().read_u64(DATA) {
            let _ = ctx.memory().write_u64(DATA, count + 1);
        }
        std::thread::sleep(self.pause);
        Step::Continue
    }
}

/// Calls `snapshot` directly and records the error flag, rip and rax.
struct Direct;

impl GuestProgram for Direct {
    fn name(&self) -> &str {
        "direct"
    }

    fn step(&self, ctx: &mut VcpuContext<'_>) -> Step {
        let failed = ctx.snapshot(LABEL, "direct call").is_err();
        ctx.memory().write_u64(DATA, failed as u64).unwrap();
        ctx.memory().write_u64(RESULT, ctx.regs().rip).unwrap();
        ctx.memory()
            .write_u64(RESULT + 8, ctx.regs().get(Gpr::Rax))
            .unwrap();
        Step::ExitGroup(0)
    }
}

const MAIN_INIT: u64 = 0x2000;
const MAIN_WAIT: u64 = 0x2001;
const MAIN_TAKE: u64 = 0x2002;
const MAIN_AFTER: u64 = 0x2003;
const MAIN_CHECK: u64 = 0x2004;
const WORKER: u64 = 0x2100;
/// Worker progress counter.
const WORKER_COUNT: u64 = DATA + 32;

/// Registers the second vCPU of [`Pair`] starts with.
fn worker_regs() -> RegisterFile {
    let mut regs = RegisterFile::at_entry(WORKER, STACK - 0x10000);
    regs.set(Gpr::Rbx, 0xb0b);
    regs.set(Gpr::R12, 0x1234);
    regs
}

/// Two vCPUs: a worker that counts while its registers are intact, and a
/// main thread that snapshots once the worker is running and, after a
/// restart, exits with 7 once the worker makes progress again.
struct Pair;

impl GuestProgram for Pair {
    fn name(&self) -> &str {
        "pair"
    }

    fn step(&self, ctx: &mut VcpuContext<'_>) -> Step {
        match ctx.regs().rip {
            MAIN_INIT => {
                ctx.spawn_vcpu(worker_regs()).unwrap();
                ctx.regs_mut().rip = MAIN_WAIT;
            }
            MAIN_WAIT => {
                if ctx.memory().read_u64(WORKER_COUNT).unwrap() >= 3 {
                    ctx.regs_mut().rip = MAIN_TAKE;
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            MAIN_TAKE => {
                let status = ctx.take(LABEL, "pair running");
                ctx.memory().write_u64(DATA + 8, status as i64 as u64).unwrap();
            }
            MAIN_AFTER => {
                ctx.memory().write_u64(RESULT, ctx.regs().rip).unwrap();
                let rax = ctx.regs().get(Gpr::Rax);
                ctx.memory().write_u64(RESULT + 8, rax).unwrap();
                let seen = ctx.memory().read_u64(WORKER_COUNT).unwrap();
                ctx.memory().write_u64(RESULT + 16, seen).unwrap();
                ctx.regs_mut().rip = MAIN_CHECK;
            }
            MAIN_CHECK => {
                let seen = ctx.memory().read_u64(RESULT + 16).unwrap();
                if ctx.memory().read_u64(WORKER_COUNT).unwrap() > seen {
                    return Step::ExitGroup(7);
                }
                let attempts = ctx.memory().read_u64(RESULT + 24).unwrap() + 1;
                ctx.memory().write_u64(RESULT + 24, attempts).unwrap();
                if attempts > 5000 {
                    return Step::ExitGroup(-2);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            WORKER => {
                let regs = ctx.regs();
                if regs.get(Gpr::Rbx) == 0xb0b && regs.get(Gpr::R12) == 0x1234 {
                    let count = ctx.memory().read_u64(WORKER_COUNT).unwrap();
                    ctx.memory().write_u64(WORKER_COUNT, count + 1).unwrap();
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            _ => return Step::ExitGroup(-1),
        }
        Step::Continue
    }
}

fn idle(pause_ms: u64) -> Arc<Idle> {
    Arc::new(Idle {
        pause: Duration::from_millis(pause_ms),
    })
}

fn image_dir(temp: &TempDir) -> PathBuf {
    temp.path().join("images")
}

fn config(temp: &TempDir) -> SnapshotConfig {
    SnapshotConfig::default().with_directory(image_dir(temp))
}

fn map_layout(guest: &Guest) {
    let memory = guest.memory();
    memory.map_anonymous(DATA, PAGE, Protection::READ_WRITE).unwrap();
    memory
        .map_anonymous(RESULT, PAGE, Protection::READ_WRITE)
        .unwrap();
    memory.map_guard(GUARD, 2 * PAGE).unwrap();
}

fn entry(rip: u64) -> RegisterFile {
    RegisterFile::at_entry(rip, STACK)
}

fn page(guest: &Guest, addr: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; PAGE as usize];
    guest.memory().read(addr, &mut bytes).unwrap();
    bytes
}

fn snap_files(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

fn connected_stream() -> (TcpListener, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    (listener, stream)
}

#[test]
fn test_guest_snapshot_terminates_and_restart_resumes() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);

    let guest = Guest::new(Arc::new(Counter), config.clone());
    map_layout(&guest);
    guest
        .signals()
        .set(10, SignalDisposition::handler(0x4000))
        .unwrap();
    guest.start(entry(INIT)).unwrap();

    let image_path = image_dir(&temp).join("test_snap.snap");
    assert_eq!(
        guest.wait(),
        GuestExit::Snapshotted {
            path: image_path.clone()
        }
    );
    let data_before = page(&guest, DATA);
    let layout_before = guest.memory().layout();
    drop(guest);

    let image = ImageReader::open(&image_path).unwrap();
    assert_eq!(image.header.label.as_str(), LABEL);
    assert_eq!(image.header.description, "counter reached five");
    assert_eq!(image.metadata.program, "counter");
    let thread = image.execution.continuation().unwrap();
    assert_eq!(thread.registers.rip, AFTER);
    assert!(thread.pending_signals.contains(12));
    assert!(thread.blocked_signals.contains(12));

    let restarted = RestartLoader::new(config)
        .restart_label(LABEL, Arc::new(Counter))
        .unwrap();
    assert_eq!(restarted.report.threads, 1);
    assert_eq!(restarted.report.regions, 3);

    let guest = restarted.guest;
    assert_eq!(guest.wait(), GuestExit::Exited(5));
    assert_eq!(guest.memory().layout(), layout_before);
    assert_eq!(page(&guest, DATA), data_before);
    assert_eq!(guest.memory().read_u64(RESULT).unwrap(), AFTER);
    assert_eq!(guest.memory().read_u64(RESULT + 8).unwrap(), 0);
    assert_eq!(
        guest.signals().get(10).unwrap(),
        SignalDisposition::handler(0x4000)
    );
}

#[test]
fn test_live_snapshot_keeps_guest_running() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp).with_live(true);

    let guest = Guest::new(Arc::new(Counter), config.clone());
    map_layout(&guest);
    guest.start(entry(INIT)).unwrap();

    assert_eq!(guest.wait(), GuestExit::Exited(5));
    assert_eq!(guest.memory().read_u64(DATA + 8).unwrap(), 0);
    assert_eq!(guest.memory().read_u64(RESULT).unwrap(), AFTER);

    let image = ImageReader::open(image_dir(&temp).join("test_snap.snap")).unwrap();
    assert!(image.header.live);
}

#[test]
fn test_open_file_offset_survives_restart() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let data_file = temp.path().join("data.bin");
    fs::write(&data_file, [7u8; 200]).unwrap();

    let guest = Guest::new(Arc::new(Counter), config.clone());
    map_layout(&guest);
    let fd = guest
        .fds()
        .open(&data_file, OFlag::O_RDWR, Mode::empty(), true)
        .unwrap();
    assert_eq!(guest.fds().seek(fd, 100, Whence::SeekSet).unwrap(), 100);
    guest.start(entry(INIT)).unwrap();
    assert!(matches!(guest.wait(), GuestExit::Snapshotted { .. }));
    drop(guest);

    let restarted = RestartLoader::new(config)
        .restart_label(LABEL, Arc::new(Counter))
        .unwrap();
    assert!(restarted.report.unavailable.is_empty());
    let guest = restarted.guest;
    assert_eq!(guest.wait(), GuestExit::Exited(5));
    assert_eq!(guest.memory().read_u64(RESULT).unwrap(), TAKE + 1);

    assert_eq!(guest.fds().seek(fd, 0, Whence::SeekCur).unwrap(), 100);
    let mut buf = [0u8; 4];
    assert_eq!(guest.fds().read(fd, &mut buf).unwrap(), 4);
    assert_eq!(buf, [7u8; 4]);
}

#[test]
fn test_restart_fails_when_required_file_is_gone() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let data_file = temp.path().join("data.bin");
    fs::write(&data_file, b"payload").unwrap();

    let guest = Guest::new(Arc::new(Counter), config.clone());
    map_layout(&guest);
    let fd = guest
        .fds()
        .open(&data_file, OFlag::O_RDONLY, Mode::empty(), true)
        .unwrap();
    guest.start(entry(INIT)).unwrap();
    assert!(matches!(guest.wait(), GuestExit::Snapshotted { .. }));
    drop(guest);

    fs::remove_file(&data_file).unwrap();
    let result = RestartLoader::new(config).restart_label(LABEL, Arc::new(Counter));
    match result {
        Err(SnapshotError::ResourceUnavailable { fd: missing, .. }) => assert_eq!(missing, fd),
        other => panic!("expected ResourceUnavailable, got {:?}", other.map(|r| r.report)),
    }
}

#[test]
fn test_restart_is_repeatable() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);

    let guest = Guest::new(Arc::new(Counter), config.clone());
    map_layout(&guest);
    guest.start(entry(INIT)).unwrap();
    assert!(matches!(guest.wait(), GuestExit::Snapshotted { .. }));
    drop(guest);

    let image_path = image_dir(&temp).join("test_snap.snap");
    let image_bytes = fs::read(&image_path).unwrap();
    let loader = RestartLoader::new(config);

    let mut results = Vec::new();
    for _ in 0..2 {
        let restarted = loader.restart(&image_path, Arc::new(Counter)).unwrap();
        let guest = restarted.guest;
        assert_eq!(guest.wait(), GuestExit::Exited(5));
        results.push((page(&guest, DATA), page(&guest, RESULT)));
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(fs::read(&image_path).unwrap(), image_bytes);
}

#[test]
fn test_failed_take_returns_failure_to_guest() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp).with_strict_descriptors(true);
    let (_listener, stream) = connected_stream();

    let guest = Guest::new(Arc::new(Counter), config);
    map_layout(&guest);
    guest.fds().install(OwnedFd::from(stream), false).unwrap();
    guest.start(entry(INIT)).unwrap();

    // The guest keeps running past the failed call
    assert_eq!(guest.wait(), GuestExit::Exited(5));
    assert_eq!(guest.memory().read_u64(DATA + 8).unwrap(), u64::MAX);
    assert_eq!(guest.memory().read_u64(RESULT).unwrap(), AFTER);
    assert_eq!(guest.memory().read_u64(RESULT + 8).unwrap(), u64::MAX);
    assert!(snap_files(&image_dir(&temp)).is_empty());
}

#[test]
fn test_failed_snapshot_leaves_failure_in_rax() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp).with_strict_descriptors(true);
    let (_listener, stream) = connected_stream();

    let guest = Guest::new(Arc::new(Direct), config);
    map_layout(&guest);
    guest.fds().install(OwnedFd::from(stream), false).unwrap();
    guest.start(entry(INIT)).unwrap();

    assert_eq!(guest.wait(), GuestExit::Exited(0));
    assert_eq!(guest.memory().read_u64(DATA).unwrap(), 1);
    assert_eq!(guest.memory().read_u64(RESULT).unwrap(), INIT + 1);
    assert_eq!(guest.memory().read_u64(RESULT + 8).unwrap(), u64::MAX);
    assert!(snap_files(&image_dir(&temp)).is_empty());
}

#[test]
fn test_lenient_mode_closes_connected_socket() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp).with_live(true);
    let (_listener, stream) = connected_stream();

    let guest = Guest::new(Arc::new(Counter), config.clone());
    map_layout(&guest);
    let fd = guest.fds().install(OwnedFd::from(stream), false).unwrap();
    guest.start(entry(INIT)).unwrap();
    assert_eq!(guest.wait(), GuestExit::Exited(5));
    drop(guest);

    let image_path = image_dir(&temp).join("test_snap.snap");
    let image = ImageReader::open(&image_path).unwrap();
    assert_eq!(image.metadata.warnings.len(), 1);
    assert!(matches!(
        image.descriptors.get(fd).unwrap().kind,
        DescriptorKind::Closed { .. }
    ));

    let restarted = RestartLoader::new(config)
        .restart(&image_path, Arc::new(Counter))
        .unwrap();
    assert_eq!(restarted.report.closed, vec![fd]);
    assert!(!restarted.guest.fds().contains(fd));
    assert_eq!(restarted.guest.wait(), GuestExit::Exited(5));
}

#[test]
fn test_host_snapshot_rejects_connected_socket_in_strict_mode() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp)
        .with_live(true)
        .with_strict_descriptors(true);
    let (_listener, stream) = connected_stream();

    let guest = Guest::new(idle(5), config);
    map_layout(&guest);
    let fd = guest.fds().install(OwnedFd::from(stream), false).unwrap();
    guest.start(entry(0)).unwrap();

    match guest.take("strict", "") {
        Err(SnapshotError::UnsupportedResource { fd: rejected, .. }) => assert_eq!(rejected, fd),
        other => panic!("expected UnsupportedResource, got {:?}", other),
    }
    assert!(!guest.is_exiting());
    assert!(snap_files(&image_dir(&temp)).is_empty());
}

#[test]
fn test_invalid_label_is_rejected() {
    let temp = TempDir::new().unwrap();
    let guest = Guest::new(idle(5), config(&temp).with_live(true));
    map_layout(&guest);
    guest.start(entry(0)).unwrap();

    assert!(matches!(
        guest.take("../escape", ""),
        Err(SnapshotError::InvalidLabel { .. })
    ));
    assert!(matches!(
        guest.take("", ""),
        Err(SnapshotError::InvalidLabel { .. })
    ));
    assert!(snap_files(&image_dir(&temp)).is_empty());
}

#[test]
fn test_concurrent_takes_allow_one_in_flight() {
    let temp = TempDir::new().unwrap();
    let guest = Guest::new(idle(100), config(&temp).with_live(true));
    map_layout(&guest);
    guest.start(entry(0)).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let start = Barrier::new(4);
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let guest = &guest;
                let start = &start;
                scope.spawn(move || {
                    start.wait();
                    guest.take(&format!("race{}", i), "")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert!(succeeded >= 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, SnapshotError::SnapshotInProgress), "{}", e);
        }
    }
    assert_eq!(snap_files(&image_dir(&temp)).len(), succeeded);
}

#[test]
fn test_quiesce_timeout_resumes_guest() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp)
        .with_live(true)
        .with_quiesce_timeout(Duration::from_millis(50));

    let guest = Guest::new(idle(300), config);
    map_layout(&guest);
    guest.start(entry(0)).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    assert!(matches!(
        guest.take("slow", ""),
        Err(SnapshotError::QuiesceTimeout { .. })
    ));
    assert!(snap_files(&image_dir(&temp)).is_empty());

    let before = guest.memory().read_u64(DATA).unwrap();
    std::thread::sleep(Duration::from_millis(800));
    assert!(guest.memory().read_u64(DATA).unwrap() > before);
}

#[test]
fn test_unreadable_region_fails_capture() {
    let temp = TempDir::new().unwrap();
    let backing = temp.path().join("backing.bin");
    fs::write(&backing, vec![1u8; 2 * PAGE as usize]).unwrap();

    let guest = Guest::new(idle(5), config(&temp).with_live(true));
    map_layout(&guest);
    guest
        .memory()
        .map_file(0x40_0000, &backing, 0, 2 * PAGE, Protection::READ)
        .unwrap();
    OpenOptions::new()
        .write(true)
        .open(&backing)
        .unwrap()
        .set_len(100)
        .unwrap();
    guest.start(entry(0)).unwrap();

    assert!(matches!(
        guest.take("truncated", ""),
        Err(SnapshotError::CaptureFailed { .. })
    ));
    assert!(!guest.is_exiting());
    assert!(snap_files(&image_dir(&temp)).is_empty());
}

#[test]
fn test_restart_rejects_other_program_and_corrupt_image() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp).with_live(true);

    let guest = Guest::new(idle(5), config.clone());
    map_layout(&guest);
    guest.start(entry(0)).unwrap();
    let outcome = guest.take("idle_snap", "").unwrap();
    drop(guest);

    let loader = RestartLoader::new(config);
    assert!(matches!(
        loader.restart(&outcome.path, Arc::new(Counter)),
        Err(SnapshotError::IncompatibleFormat { .. })
    ));

    let mut bytes = fs::read(&outcome.path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    let corrupt = temp.path().join("corrupt.snap");
    fs::write(&corrupt, bytes).unwrap();
    assert!(loader.restart(&corrupt, idle(5)).is_err());
}

#[test]
fn test_listener_is_rebound_on_restart() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp).with_live(true);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let guest = Guest::new(idle(5), config.clone());
    map_layout(&guest);
    let fd = guest.fds().install(OwnedFd::from(listener), true).unwrap();
    guest.start(entry(0)).unwrap();
    let outcome = guest.take("server", "listening").unwrap();
    assert!(outcome.warnings.is_empty());
    // Release the port before restarting
    drop(guest);

    let restarted = RestartLoader::new(config)
        .restart(&outcome.path, idle(5))
        .unwrap();
    assert!(restarted.report.unavailable.is_empty());
    assert!(restarted.guest.fds().contains(fd));
    assert!(TcpStream::connect(addr).is_ok());
}

#[test]
fn test_two_vcpus_snapshot_and_restart() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);

    let guest = Guest::new(Arc::new(Pair), config.clone());
    map_layout(&guest);
    guest.start(entry(MAIN_INIT)).unwrap();

    let image_path = image_dir(&temp).join("test_snap.snap");
    assert_eq!(
        guest.wait(),
        GuestExit::Snapshotted {
            path: image_path.clone()
        }
    );
    drop(guest);

    let image = ImageReader::open(&image_path).unwrap();
    let threads = &image.execution.threads;
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].thread_id, 0);
    assert!(threads[0].continuation);
    assert_eq!(threads[0].registers.rip, MAIN_AFTER);
    assert_eq!(threads[0].registers.get(Gpr::Rax), 0);
    assert_eq!(threads[1].thread_id, 1);
    assert!(!threads[1].continuation);
    assert_eq!(threads[1].registers, worker_regs());

    let restarted = RestartLoader::new(config)
        .restart_label(LABEL, Arc::new(Pair))
        .unwrap();
    assert_eq!(restarted.report.threads, 2);

    let guest = restarted.guest;
    assert_eq!(guest.wait(), GuestExit::Exited(7));
    assert_eq!(guest.memory().read_u64(RESULT).unwrap(), MAIN_AFTER);
    assert_eq!(guest.memory().read_u64(RESULT + 8).unwrap(), 0);
    assert!(guest.memory().read_u64(RESULT + 16).unwrap() >= 3);
}
