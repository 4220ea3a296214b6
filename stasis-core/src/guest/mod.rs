// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process guest host.
//!
//! A guest is an address space, a descriptor table, signal dispositions and a
//! set of vCPUs. Each vCPU runs on its own host thread and drives a
//! [`GuestProgram`] one step at a time, passing through the quiesce barrier
//! between steps.

pub mod fdtable;
pub mod memory;
pub mod safepoint;
pub mod signals;
pub mod vcpu;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::config::SnapshotConfig;
use crate::controller::{ProcessController, SnapshotOutcome};
use crate::error::{GuestError, SnapshotError};
use crate::types::VcpuId;

pub use fdtable::FdTable;
pub use memory::{Backing, GuestMemory, GUEST_PAGE_SIZE};
pub use safepoint::QuiesceBarrier;
pub use signals::{SigSet, SignalDisposition, SignalTable};
pub use vcpu::{Gpr, RegisterFile, Step, VcpuContext, HCALL_INSN_LEN};

use vcpu::VcpuSlot;

/// Code run by guest vCPUs.
///
/// `step` is called repeatedly on each vCPU thread; the program dispatches on
/// the instruction pointer and keeps its state in guest memory and registers
/// so that a snapshot captures all of it.
pub trait GuestProgram: Send + Sync + 'static {
    /// Name recorded in images; restart requires the same name.
    fn name(&self) -> &str;

    fn step(&self, ctx: &mut VcpuContext<'_>) -> Step;
}

/// How a guest ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestExit {
    /// All threads exited, or one called for a group exit with this status.
    Exited(i32),
    /// Terminated after a successful non-live snapshot.
    Snapshotted { path: PathBuf },
    /// Stopped by the host.
    Terminated,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the guest handle and its vCPU threads.
pub(crate) struct GuestInner {
    pub(crate) program: Arc<dyn GuestProgram>,
    pub(crate) config: SnapshotConfig,
    pub(crate) memory: GuestMemory,
    pub(crate) fds: FdTable,
    pub(crate) signals: SignalTable,
    pub(crate) barrier: QuiesceBarrier,
    pub(crate) controller: ProcessController,
    vcpus: Mutex<BTreeMap<VcpuId, Arc<VcpuSlot>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_vcpu: AtomicU32,
    exiting: AtomicBool,
    exit: Mutex<Option<GuestExit>>,
}

impl GuestInner {
    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Record how the guest ends. The first request wins.
    pub(crate) fn request_exit(&self, how: GuestExit) {
        let mut exit = lock(&self.exit);
        if exit.is_none() {
            tracing::debug!(program = self.program.name(), exit = ?how, "Guest exiting");
            *exit = Some(how);
        }
        self.exiting.store(true, Ordering::Release);
    }

    pub(crate) fn vcpu_slot(&self, id: VcpuId) -> Option<Arc<VcpuSlot>> {
        lock(&self.vcpus).get(&id).cloned()
    }

    /// Live vCPUs in id order.
    pub(crate) fn vcpu_slots(&self) -> Vec<(VcpuId, Arc<VcpuSlot>)> {
        lock(&self.vcpus)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect()
    }

    pub(crate) fn spawn_vcpu(self: &Arc<Self>, registers: RegisterFile) -> Result<VcpuId, GuestError> {
        if self.is_exiting() {
            return Err(GuestError::Exiting);
        }
        let id = VcpuId::new(self.next_vcpu.fetch_add(1, Ordering::SeqCst));
        let slot = Arc::new(VcpuSlot::new(registers, SigSet::empty(), SigSet::empty()));
        self.install_vcpu(id, Arc::clone(&slot));
        self.start_vcpu(id, slot)?;
        Ok(id)
    }

    /// Make a vCPU visible to the barrier and to capture without running it.
    pub(crate) fn install_vcpu(&self, id: VcpuId, slot: Arc<VcpuSlot>) {
        lock(&self.vcpus).insert(id, slot);
        self.barrier.register(id);
        self.next_vcpu.fetch_max(id.value() + 1, Ordering::SeqCst);
    }

    pub(crate) fn start_vcpu(self: &Arc<Self>, id: VcpuId, slot: Arc<VcpuSlot>) -> Result<(), GuestError> {
        let inner = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(id.to_string())
            .spawn(move || run_vcpu(inner, id, slot));

        match spawned {
            Ok(handle) => {
                lock(&self.threads).push(handle);
                Ok(())
            }
            Err(e) => {
                self.retire_vcpu(id);
                Err(GuestError::SpawnFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn retire_vcpu(&self, id: VcpuId) {
        let remaining = {
            let mut vcpus = lock(&self.vcpus);
            vcpus.remove(&id);
            vcpus.len()
        };
        self.barrier.deregister(id);
        tracing::debug!(vcpu = %id, remaining, "vCPU exited");

        if remaining == 0 {
            self.request_exit(GuestExit::Exited(0));
        }
    }
}

/// Deregisters the vCPU even if the guest program panics.
struct RetireOnDrop<'a> {
    inner: &'a GuestInner,
    id: VcpuId,
}

impl Drop for RetireOnDrop<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(vcpu = %self.id, "Guest program panicked");
            self.inner.request_exit(GuestExit::Terminated);
        }
        self.inner.retire_vcpu(self.id);
    }
}

fn run_vcpu(inner: Arc<GuestInner>, id: VcpuId, slot: Arc<VcpuSlot>) {
    let _retire = RetireOnDrop { inner: &inner, id };
    tracing::debug!(vcpu = %id, "vCPU started");

    loop {
        if inner.is_exiting() {
            break;
        }
        inner.barrier.safepoint(id);
        if inner.is_exiting() {
            break;
        }

        let step = {
            let mut regs = lock(&slot.registers);
            let mut ctx = VcpuContext::new(&inner, id, &slot, &mut regs);
            inner.program.step(&mut ctx)
        };

        match step {
            Step::Continue => {}
            Step::Exit => break,
            Step::ExitGroup(code) => {
                inner.request_exit(GuestExit::Exited(code));
                break;
            }
        }
    }
}

/// Handle to a running guest. Dropping it terminates the guest.
pub struct Guest {
    inner: Arc<GuestInner>,
}

impl Guest {
    pub fn new(program: Arc<dyn GuestProgram>, config: SnapshotConfig) -> Self {
        Self {
            inner: Arc::new(GuestInner {
                program,
                config,
                memory: GuestMemory::new(),
                fds: FdTable::new(),
                signals: SignalTable::new(),
                barrier: QuiesceBarrier::new(),
                controller: ProcessController::new(),
                vcpus: Mutex::new(BTreeMap::new()),
                threads: Mutex::new(Vec::new()),
                next_vcpu: AtomicU32::new(0),
                exiting: AtomicBool::new(false),
                exit: Mutex::new(None),
            }),
        }
    }

    pub fn program_name(&self) -> &str {
        self.inner.program.name()
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.inner.config
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.inner.memory
    }

    pub fn fds(&self) -> &FdTable {
        &self.inner.fds
    }

    pub fn signals(&self) -> &SignalTable {
        &self.inner.signals
    }

    /// Start the first thread at the given registers.
    pub fn start(&self, registers: RegisterFile) -> Result<VcpuId, GuestError> {
        self.spawn_vcpu(registers)
    }

    pub fn spawn_vcpu(&self, registers: RegisterFile) -> Result<VcpuId, GuestError> {
        self.inner.spawn_vcpu(registers)
    }

    /// Live vCPU ids in ascending order.
    pub fn vcpu_ids(&self) -> Vec<VcpuId> {
        lock(&self.inner.vcpus).keys().copied().collect()
    }

    /// Copy of a vCPU's registers, taken between steps.
    pub fn vcpu_registers(&self, id: VcpuId) -> Option<RegisterFile> {
        let slot = self.inner.vcpu_slot(id)?;
        let regs = lock(&slot.registers).clone();
        Some(regs)
    }

    /// Pending and blocked signals of a vCPU.
    pub fn vcpu_signals(&self, id: VcpuId) -> Option<(SigSet, SigSet)> {
        let slot = self.inner.vcpu_slot(id)?;
        Some((slot.pending(), slot.blocked()))
    }

    /// Snapshot the guest from the host side. The lowest-numbered vCPU is
    /// recorded as the continuation thread.
    pub fn take(&self, label: &str, description: &str) -> Result<SnapshotOutcome, SnapshotError> {
        self.inner
            .controller
            .take(&self.inner, None, label, description, self.inner.config.live)
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.is_exiting()
    }

    /// Ask every vCPU to stop after its current step.
    pub fn terminate(&self) {
        self.inner.request_exit(GuestExit::Terminated);
    }

    /// Block until every vCPU thread has exited.
    pub fn wait(&self) -> GuestExit {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.threads));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::warn!("vCPU thread panicked");
                }
            }
        }
        lock(&self.inner.exit).clone().unwrap_or(GuestExit::Exited(0))
    }

    pub(crate) fn inner(&self) -> &Arc<GuestInner> {
        &self.inner
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        if !self.inner.is_exiting() {
            self.terminate();
        }
        self.wait();
    }
}

impl std::fmt::Debug for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guest")
            .field("program", &self.program_name())
            .field("vcpus", &self.vcpu_ids())
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Counts to `target` in memory at 0x10000, then exits with the count.
    struct Counter {
        target: u64,
    }

    impl GuestProgram for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn step(&self, ctx: &mut VcpuContext<'_>) -> Step {
            let Ok(count) = ctx.memory().read_u64(0x10000) else {
                return Step::ExitGroup(-1);
            };
            if count >= self.target {
                return Step::ExitGroup(count as i32);
            }
            if ctx.memory().write_u64(0x10000, count + 1).is_err() {
                return Step::ExitGroup(-1);
            }
            ctx.regs_mut().rip += 1;
            Step::Continue
        }
    }

    struct Idle;

    impl GuestProgram for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn step(&self, _ctx: &mut VcpuContext<'_>) -> Step {
            std::thread::sleep(Duration::from_millis(1));
            Step::Continue
        }
    }

    #[test]
    fn test_guest_runs_to_exit() {
        let guest = Guest::new(Arc::new(Counter { target: 50 }), SnapshotConfig::default());
        guest
            .memory()
            .map_anonymous(0x10000, GUEST_PAGE_SIZE, crate::types::Protection::READ_WRITE)
            .unwrap();
        guest.start(RegisterFile::at_entry(0, 0)).unwrap();

        assert_eq!(guest.wait(), GuestExit::Exited(50));
        assert!(guest.vcpu_ids().is_empty());
        assert_eq!(guest.memory().read_u64(0x10000).unwrap(), 50);
    }

    #[test]
    fn test_terminate() {
        let guest = Guest::new(Arc::new(Idle), SnapshotConfig::default());
        let a = guest.start(RegisterFile::default()).unwrap();
        let b = guest.spawn_vcpu(RegisterFile::default()).unwrap();
        assert_ne!(a, b);
        assert_eq!(guest.vcpu_ids().len(), 2);

        guest.terminate();
        assert_eq!(guest.wait(), GuestExit::Terminated);
        assert!(matches!(
            guest.spawn_vcpu(RegisterFile::default()),
            Err(GuestError::Exiting)
        ));
    }

    #[test]
    fn test_fault_exits_guest() {
        // No memory mapped: the first read faults
        let guest = Guest::new(Arc::new(Counter { target: 1 }), SnapshotConfig::default());
        guest.start(RegisterFile::default()).unwrap();
        assert_eq!(guest.wait(), GuestExit::Exited(-1));
    }
}
