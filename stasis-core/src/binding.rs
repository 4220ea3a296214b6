// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Guest-facing snapshot call.
//!
//! Guests see a single `take(label, description)` returning [`TAKE_SUCCESS`]
//! or [`TAKE_FAILURE`]. The detailed error is logged on the host and never
//! crosses into the guest.

use crate::error::SnapshotError;
use crate::guest::vcpu::{Gpr, VcpuContext};

/// Status returned to the guest when the snapshot was written.
pub const TAKE_SUCCESS: i32 = 0;

/// Status returned to the guest when the snapshot failed.
pub const TAKE_FAILURE: i32 = -1;

/// Map a snapshot result onto the guest status code.
pub fn status<T>(result: &Result<T, SnapshotError>) -> i32 {
    match result {
        Ok(_) => TAKE_SUCCESS,
        Err(_) => TAKE_FAILURE,
    }
}

/// Take a snapshot on behalf of the guest thread running `ctx`. The status
/// is also left in the guest's `rax`.
pub fn take(ctx: &mut VcpuContext<'_>, label: &str, description: &str) -> i32 {
    let result = ctx.snapshot(label, description);
    let code = status(&result);
    if let Err(e) = &result {
        tracing::error!(vcpu = %ctx.id(), label, error = %e, "take failed");
    }
    ctx.regs_mut().set(Gpr::Rax, code as i64 as u64);
    code
}
