// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Built-in counter guest used by `stasis demo` and `stasis restore`.
//!
//! The guest counts up to a limit kept in its own memory and takes a
//! snapshot when it reaches `take_at`. After a restart it reads extra
//! iterations from the snapshot input file, keeps counting, and writes the
//! final count to the snapshot output file.

use stasis_core::guest::{Gpr, GuestMemory, HCALL_INSN_LEN};
use stasis_core::{
    Guest, GuestError, GuestProgram, Protection, RegisterFile, Step, VcpuContext, TAKE_SUCCESS,
};

const ENTRY: u64 = 0x40_1000;
const LOOP: u64 = ENTRY + 0x10;
const TAKE: u64 = ENTRY + 0x20;
const RESUME: u64 = TAKE + HCALL_INSN_LEN;

const DATA: u64 = 0x60_0000;
const COUNT: u64 = DATA;
const LIMIT: u64 = DATA + 8;
const TAKE_AT: u64 = DATA + 16;
const STATUS: u64 = DATA + 24;

const STACK: u64 = 0x7ff0_0000;
const STACK_SIZE: u64 = 16 * 4096;

/// Counter values read back from guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    pub limit: u64,
    /// Status the guest's snapshot call returned.
    pub status: i64,
}

pub struct Counter {
    label: String,
}

impl Counter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    /// Lay out guest memory for a fresh run.
    pub fn prepare(guest: &Guest, take_at: u64, iterations: u64) -> Result<(), GuestError> {
        let memory = guest.memory();
        memory.map_anonymous(DATA, 4096, Protection::READ_WRITE)?;
        memory.set_name(DATA, "counter")?;
        memory.map_guard(STACK - STACK_SIZE - 4096, 4096)?;
        memory.map_anonymous(STACK - STACK_SIZE, STACK_SIZE, Protection::READ_WRITE)?;
        memory.set_name(STACK - STACK_SIZE, "stack")?;
        memory.write_u64(LIMIT, iterations)?;
        memory.write_u64(TAKE_AT, take_at)?;
        Ok(())
    }

    pub fn entry() -> RegisterFile {
        RegisterFile::at_entry(ENTRY, STACK)
    }

    pub fn state(memory: &GuestMemory) -> Result<CounterState, GuestError> {
        Ok(CounterState {
            count: memory.read_u64(COUNT)?,
            limit: memory.read_u64(LIMIT)?,
            status: memory.read_u64(STATUS)? as i64,
        })
    }

    fn run(&self, ctx: &mut VcpuContext<'_>) -> Result<Step, GuestError> {
        match ctx.regs().rip {
            ENTRY => {
                ctx.memory().write_u64(COUNT, 0)?;
                ctx.regs_mut().rip = LOOP;
            }
            LOOP => {
                let count = ctx.memory().read_u64(COUNT)? + 1;
                ctx.memory().write_u64(COUNT, count)?;
                if count == ctx.memory().read_u64(TAKE_AT)? {
                    ctx.regs_mut().rip = TAKE;
                } else if count >= ctx.memory().read_u64(LIMIT)? {
                    let report = format!("{}\n", count);
                    ctx.snapshot_putdata(report.as_bytes())?;
                    return Ok(Step::ExitGroup(0));
                }
            }
            TAKE => {
                let status = ctx.take(&self.label, "counter demo");
                ctx.memory().write_u64(STATUS, status as i64 as u64)?;
            }
            RESUME => {
                if ctx.regs().get(Gpr::Rax) == TAKE_SUCCESS as u64 {
                    let mut buf = [0u8; 32];
                    let read = ctx.snapshot_getdata(&mut buf)?;
                    let extra = std::str::from_utf8(&buf[..read])
                        .ok()
                        .and_then(|s| s.trim().parse::<u64>().ok())
                        .unwrap_or(0);
                    let limit = ctx.memory().read_u64(LIMIT)?;
                    ctx.memory().write_u64(LIMIT, limit + extra)?;
                }
                ctx.regs_mut().rip = LOOP;
            }
            rip => {
                tracing::error!(vcpu = %ctx.id(), rip, "Counter jumped to an unknown address");
                return Ok(Step::ExitGroup(2));
            }
        }
        Ok(Step::Continue)
    }
}

impl GuestProgram for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn step(&self, ctx: &mut VcpuContext<'_>) -> Step {
        self.run(ctx).unwrap_or_else(|e| {
            tracing::error!(vcpu = %ctx.id(), error = %e, "Counter guest faulted");
            Step::ExitGroup(1)
        })
    }
}
