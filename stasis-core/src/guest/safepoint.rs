// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stop-the-world barrier.
//!
//! Every vCPU passes through [`QuiesceBarrier::safepoint`] between guest steps.
//! A snapshot asks all other vCPUs to stop there, waits (bounded) until they
//! have, and resumes them when the returned guard is dropped.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::SnapshotError;
use crate::state::VcpuRunState;
use crate::types::VcpuId;

#[derive(Debug, Default)]
struct BarrierState {
    vcpus: BTreeMap<VcpuId, VcpuRunState>,
    quiescing: bool,
}

impl BarrierState {
    fn set(&mut self, id: VcpuId, target: VcpuRunState) {
        if let Some(state) = self.vcpus.get_mut(&id) {
            if state.can_transition_to(target) {
                *state = target;
            } else {
                tracing::warn!(vcpu = %id, from = %state, to = %target, "Ignoring invalid vCPU transition");
            }
        }
    }

    fn release(&mut self) {
        for state in self.vcpus.values_mut() {
            if *state != VcpuRunState::Running {
                *state = VcpuRunState::Running;
            }
        }
        self.quiescing = false;
    }
}

/// Coordinates vCPUs around a snapshot.
#[derive(Debug, Default)]
pub struct QuiesceBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

impl QuiesceBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new vCPU. One created mid-quiesce stops at its first safepoint.
    pub fn register(&self, id: VcpuId) {
        let mut state = self.lock();
        let initial = if state.quiescing {
            VcpuRunState::QuiesceRequested
        } else {
            VcpuRunState::Running
        };
        state.vcpus.insert(id, initial);
    }

    /// Stop tracking an exited vCPU.
    pub fn deregister(&self, id: VcpuId) {
        self.lock().vcpus.remove(&id);
        self.changed.notify_all();
    }

    pub fn state_of(&self, id: VcpuId) -> Option<VcpuRunState> {
        self.lock().vcpus.get(&id).copied()
    }

    pub fn is_quiescing(&self) -> bool {
        self.lock().quiescing
    }

    /// Park here if a quiesce has been requested for `id`.
    pub fn safepoint(&self, id: VcpuId) {
        let mut state = self.lock();
        if state.vcpus.get(&id) != Some(&VcpuRunState::QuiesceRequested) {
            return;
        }

        state.set(id, VcpuRunState::Quiesced);
        self.changed.notify_all();
        tracing::trace!(vcpu = %id, "Parked at safepoint");

        while state.vcpus.get(&id) == Some(&VcpuRunState::Quiesced) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop every vCPU except `initiator` at its next safepoint.
    ///
    /// On timeout all vCPUs are released and the ones that never arrived are
    /// reported.
    pub fn quiesce(
        &self,
        initiator: Option<VcpuId>,
        timeout: Duration,
    ) -> Result<QuiesceGuard<'_>, SnapshotError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        if state.quiescing {
            return Err(SnapshotError::SnapshotInProgress);
        }
        state.quiescing = true;

        let targets: Vec<VcpuId> = state
            .vcpus
            .keys()
            .copied()
            .filter(|id| Some(*id) != initiator)
            .collect();
        for id in &targets {
            state.set(*id, VcpuRunState::QuiesceRequested);
        }

        loop {
            let pending: Vec<VcpuId> = state
                .vcpus
                .iter()
                .filter(|(id, s)| Some(**id) != initiator && **s != VcpuRunState::Quiesced)
                .map(|(id, _)| *id)
                .collect();

            if pending.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                state.release();
                drop(state);
                self.changed.notify_all();
                return Err(SnapshotError::QuiesceTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    pending,
                });
            }

            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        tracing::debug!(
            quiesced = targets.len(),
            initiator = ?initiator,
            "Guest quiesced"
        );

        Ok(QuiesceGuard { barrier: self })
    }

    fn resume_all(&self) {
        self.lock().release();
        self.changed.notify_all();
    }
}

/// Keeps the guest stopped; dropping it resumes every parked vCPU.
#[must_use = "the guest resumes as soon as the guard is dropped"]
pub struct QuiesceGuard<'a> {
    barrier: &'a QuiesceBarrier,
}

impl Drop for QuiesceGuard<'_> {
    fn drop(&mut self) {
        self.barrier.resume_all();
        tracing::trace!("Guest resumed");
    }
}
