// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Virtual CPU register state and the per-step execution context.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::binding;
use crate::controller::{Initiator, SnapshotOutcome};
use crate::error::{GuestError, SnapshotError};
use crate::guest::fdtable::FdTable;
use crate::guest::memory::GuestMemory;
use crate::guest::signals::{SigSet, SignalTable};
use crate::guest::GuestInner;
use crate::types::VcpuId;

/// Number of general purpose registers.
pub const GPR_COUNT: usize = 16;

/// Length of the snapshot hypercall instruction. The instruction pointer is
/// advanced past it before registers are captured.
pub const HCALL_INSN_LEN: u64 = 1;

/// General purpose register names, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Gpr {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Architectural state of one vCPU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterFile {
    pub gprs: [u64; GPR_COUNT],
    pub rip: u64,
    pub rflags: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    /// Opaque extended state (FPU/vector registers).
    #[serde(skip)]
    pub extended: Vec<u8>,
}

impl RegisterFile {
    /// Registers for a thread entering at `entry` with stack top `stack`.
    pub fn at_entry(entry: u64, stack: u64) -> Self {
        let mut regs = Self {
            rip: entry,
            rflags: 0x202,
            ..Self::default()
        };
        regs.set(Gpr::Rsp, stack);
        regs
    }

    pub fn get(&self, reg: Gpr) -> u64 {
        self.gprs[reg as usize]
    }

    pub fn set(&mut self, reg: Gpr, value: u64) {
        self.gprs[reg as usize] = value;
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    pub fn stack_pointer(&self) -> u64 {
        self.get(Gpr::Rsp)
    }
}

/// Shared per-vCPU state. Registers are locked by the owning thread for the
/// duration of each step, so a parked vCPU's registers are free to read.
#[derive(Debug)]
pub(crate) struct VcpuSlot {
    pub(crate) registers: Mutex<RegisterFile>,
    pending: AtomicU64,
    blocked: AtomicU64,
}

impl VcpuSlot {
    pub(crate) fn new(registers: RegisterFile, pending: SigSet, blocked: SigSet) -> Self {
        Self {
            registers: Mutex::new(registers),
            pending: AtomicU64::new(pending.bits()),
            blocked: AtomicU64::new(blocked.bits()),
        }
    }

    pub(crate) fn pending(&self) -> SigSet {
        SigSet::from_bits(self.pending.load(Ordering::Acquire))
    }

    pub(crate) fn blocked(&self) -> SigSet {
        SigSet::from_bits(self.blocked.load(Ordering::Acquire))
    }

    pub(crate) fn raise(&self, signals: SigSet) {
        self.pending.fetch_or(signals.bits(), Ordering::AcqRel);
    }
}

/// What a vCPU does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run another step.
    Continue,
    /// This thread exits; the guest exits when its last thread does.
    Exit,
    /// The whole guest exits with this status.
    ExitGroup(i32),
}

/// Execution context handed to [`GuestProgram::step`](crate::guest::GuestProgram::step).
pub struct VcpuContext<'a> {
    guest: &'a Arc<GuestInner>,
    id: VcpuId,
    slot: &'a VcpuSlot,
    regs: &'a mut RegisterFile,
}

impl<'a> VcpuContext<'a> {
    pub(crate) fn new(
        guest: &'a Arc<GuestInner>,
        id: VcpuId,
        slot: &'a VcpuSlot,
        regs: &'a mut RegisterFile,
    ) -> Self {
        Self {
            guest,
            id,
            slot,
            regs,
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn regs(&self) -> &RegisterFile {
        self.regs
    }

    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        self.regs
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.guest.memory
    }

    pub fn fds(&self) -> &FdTable {
        &self.guest.fds
    }

    pub fn signals(&self) -> &SignalTable {
        &self.guest.signals
    }

    /// Mark `signo` pending on this thread.
    pub fn raise(&self, signo: i32) -> Result<(), GuestError> {
        self.slot.raise(SigSet::single(signo)?);
        Ok(())
    }

    /// Mark `signo` pending on another thread of the guest.
    pub fn raise_on(&self, target: VcpuId, signo: i32) -> Result<(), GuestError> {
        let signals = SigSet::single(signo)?;
        self.guest
            .vcpu_slot(target)
            .ok_or(GuestError::NoSuchVcpu { id: target })?
            .raise(signals);
        Ok(())
    }

    pub fn pending_signals(&self) -> SigSet {
        self.slot.pending()
    }

    pub fn blocked_signals(&self) -> SigSet {
        self.slot.blocked()
    }

    /// Add `signals` to this thread's blocked mask.
    pub fn block(&self, signals: SigSet) {
        self.slot.blocked.fetch_or(signals.bits(), Ordering::AcqRel);
    }

    /// Remove `signals` from this thread's blocked mask.
    pub fn unblock(&self, signals: SigSet) {
        self.slot
            .blocked
            .fetch_and(!signals.bits(), Ordering::AcqRel);
    }

    /// Dequeue the lowest pending, unblocked signal.
    pub fn next_pending_signal(&self) -> Option<i32> {
        let deliverable = self.slot.pending().difference(self.slot.blocked());
        let signo = deliverable.lowest()?;
        let bit = SigSet::single(signo).ok()?;
        self.slot.pending.fetch_and(!bit.bits(), Ordering::AcqRel);
        Some(signo)
    }

    /// Start another guest thread.
    pub fn spawn_vcpu(&self, registers: RegisterFile) -> Result<VcpuId, GuestError> {
        self.guest.spawn_vcpu(registers)
    }

    /// The snapshot hypercall: returns `0` on success, `-1` on failure.
    ///
    /// On success without live mode the guest terminates once this step
    /// returns; a restarted guest resumes at the next instruction with `0`
    /// visible to it.
    pub fn take(&mut self, label: &str, description: &str) -> i32 {
        binding::take(self, label, description)
    }

    /// Take a snapshot, reporting the detailed outcome.
    pub fn snapshot(
        &mut self,
        label: &str,
        description: &str,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let live = self.guest.config.live;
        self.snapshot_with(label, description, live)
    }

    /// Take a snapshot and keep running regardless of configuration.
    pub fn snapshot_live(
        &mut self,
        label: &str,
        description: &str,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        self.snapshot_with(label, description, true)
    }

    fn snapshot_with(
        &mut self,
        label: &str,
        description: &str,
        live: bool,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        // A restarted guest resumes past the hypercall with success in rax
        self.regs.rip = self.regs.rip.wrapping_add(HCALL_INSN_LEN);
        self.regs.set(Gpr::Rax, binding::TAKE_SUCCESS as u64);
        let initiator = Initiator {
            id: self.id,
            registers: &*self.regs,
        };
        let result = self
            .guest
            .controller
            .take(self.guest, Some(initiator), label, description, live);
        if result.is_err() {
            self.regs.set(Gpr::Rax, binding::TAKE_FAILURE as i64 as u64);
        }
        result
    }

    /// Fill `buf` from the configured snapshot input file. Returns the number
    /// of bytes read; `0` when no input is configured.
    pub fn snapshot_getdata(&self, buf: &mut [u8]) -> Result<usize, GuestError> {
        let Some(path) = &self.guest.config.input_path else {
            return Ok(0);
        };
        let file = File::open(path).map_err(|e| GuestError::Io {
            context: "opening snapshot input",
            source: e,
        })?;

        let mut total = 0;
        let mut limited = file.take(buf.len() as u64);
        loop {
            match limited.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(GuestError::Io {
                        context: "reading snapshot input",
                        source: e,
                    })
                }
            }
        }
        Ok(total)
    }

    /// Write `data` to the configured snapshot output file, replacing it.
    /// Returns the number of bytes written; `0` when no output is configured.
    pub fn snapshot_putdata(&self, data: &[u8]) -> Result<usize, GuestError> {
        let Some(path) = &self.guest.config.output_path else {
            return Ok(0);
        };
        let mut file = File::create(path).map_err(|e| GuestError::Io {
            context: "creating snapshot output",
            source: e,
        })?;
        file.write_all(data).map_err(|e| GuestError::Io {
            context: "writing snapshot output",
            source: e,
        })?;
        Ok(data.len())
    }
}
