// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Thread state capture.

use std::sync::Arc;

use crate::controller::Initiator;
use crate::error::SnapshotError;
use crate::guest::lock;
use crate::guest::vcpu::VcpuSlot;
use crate::image::{ExecutionState, ThreadState};
use crate::types::VcpuId;

/// Record every thread of a quiesced guest.
///
/// The initiator's registers come from its live context (its slot is locked
/// by its own step). Without an initiator the lowest-numbered thread is the
/// continuation.
pub fn capture(
    slots: &[(VcpuId, Arc<VcpuSlot>)],
    initiator: Option<&Initiator<'_>>,
) -> Result<ExecutionState, SnapshotError> {
    if slots.is_empty() {
        return Err(SnapshotError::CaptureFailed {
            reason: "guest has no live threads".to_string(),
        });
    }

    let continuation = match initiator {
        Some(initiator) => initiator.id,
        None => slots[0].0,
    };

    let mut threads = Vec::with_capacity(slots.len());
    for (id, slot) in slots {
        let registers = match initiator {
            Some(initiator) if initiator.id == *id => initiator.registers.clone(),
            _ => lock(&slot.registers).clone(),
        };
        threads.push(ThreadState {
            thread_id: id.value(),
            registers,
            pending_signals: slot.pending(),
            blocked_signals: slot.blocked(),
            continuation: *id == continuation,
        });
    }

    if !threads.iter().any(|t| t.continuation) {
        return Err(SnapshotError::CaptureFailed {
            reason: format!("initiating thread {} is not registered", continuation),
        });
    }

    tracing::debug!(
        threads = threads.len(),
        continuation = %continuation,
        "Captured execution state"
    );

    Ok(ExecutionState { threads })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::signals::SigSet;
    use crate::guest::vcpu::RegisterFile;

    fn slot(rip: u64) -> Arc<VcpuSlot> {
        Arc::new(VcpuSlot::new(
            RegisterFile::at_entry(rip, 0x8000),
            SigSet::single(10).unwrap(),
            SigSet::empty(),
        ))
    }

    #[test]
    fn test_lowest_thread_continues_without_initiator() {
        let slots = vec![(VcpuId::new(2), slot(0x20)), (VcpuId::new(5), slot(0x50))];
        let state = capture(&slots, None).unwrap();
        assert_eq!(state.threads.len(), 2);
        assert_eq!(state.continuation().unwrap().thread_id, 2);
        assert!(state.threads[0].pending_signals.contains(10));
    }

    #[test]
    fn test_initiator_registers_used() {
        let slots = vec![(VcpuId::new(0), slot(0x10)), (VcpuId::new(1), slot(0x20))];
        let live = RegisterFile::at_entry(0x1234, 0x9000);
        let initiator = Initiator {
            id: VcpuId::new(1),
            registers: &live,
        };

        let state = capture(&slots, Some(&initiator)).unwrap();
        let cont = state.continuation().unwrap();
        assert_eq!(cont.thread_id, 1);
        assert_eq!(cont.registers.rip, 0x1234);
        assert_eq!(state.threads[0].registers.rip, 0x10);
        assert_eq!(state.threads.iter().filter(|t| t.continuation).count(), 1);
    }

    #[test]
    fn test_no_threads() {
        assert!(matches!(
            capture(&[], None),
            Err(SnapshotError::CaptureFailed { .. })
        ));
    }

    #[test]
    fn test_unknown_initiator() {
        let slots = vec![(VcpuId::new(0), slot(0x10))];
        let regs = RegisterFile::default();
        let initiator = Initiator {
            id: VcpuId::new(9),
            registers: &regs,
        };
        assert!(capture(&slots, Some(&initiator)).is_err());
    }
}
