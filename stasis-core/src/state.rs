// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Typed state machines for quiescence and restart.
//!
//! vCPU lifecycle around a snapshot: Running → QuiesceRequested → Quiesced → Running.
//! Restart lifecycle: Loading → Validating → Reconstructing → Resuming, with
//! Failed as the error terminal. Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;

/// Per-vCPU state with respect to a stop-the-world request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VcpuRunState {
    /// Executing guest steps.
    Running,

    /// Asked to stop at its next safepoint.
    QuiesceRequested,

    /// Parked at a safepoint; holds no guest state the capture cannot see.
    Quiesced,
}

impl VcpuRunState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::QuiesceRequested => "QuiesceRequested",
            Self::Quiesced => "Quiesced",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: VcpuRunState) -> bool {
        matches!(
            (self, target),
            (Self::Running, Self::QuiesceRequested) |
            (Self::QuiesceRequested, Self::Quiesced) |
            // Cancelled before the vCPU reached its safepoint
            (Self::QuiesceRequested, Self::Running) |
            (Self::Quiesced, Self::Running)
        )
    }
}

impl std::fmt::Display for VcpuRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Phases of a restart attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPhase {
    /// Reading the image from disk.
    Loading,

    /// Checking magic, version, architecture and section invariants.
    Validating,

    /// Rebuilding memory, signal state, descriptors and vCPUs.
    Reconstructing,

    /// vCPUs started; terminal success.
    Resuming,

    /// Aborted; terminal failure.
    Failed,
}

impl RestartPhase {
    /// Get the phase name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Loading => "Loading",
            Self::Validating => "Validating",
            Self::Reconstructing => "Reconstructing",
            Self::Resuming => "Resuming",
            Self::Failed => "Failed",
        }
    }

    /// Terminal phases accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resuming | Self::Failed)
    }

    /// Check if transition to the target phase is valid.
    pub fn can_transition_to(&self, target: RestartPhase) -> bool {
        matches!(
            (self, target),
            (Self::Loading, Self::Validating)
                | (Self::Validating, Self::Reconstructing)
                | (Self::Reconstructing, Self::Resuming)
                | (Self::Loading, Self::Failed)
                | (Self::Validating, Self::Failed)
                | (Self::Reconstructing, Self::Failed)
        )
    }
}

impl std::fmt::Display for RestartPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one restart attempt.
/// Enforces valid phase transitions and tracks timing.
#[derive(Debug)]
pub struct RestartStateMachine {
    subject: String,
    current: RestartPhase,
    started: Instant,
    last_transition: Instant,
    transition_count: u64,
}

impl RestartStateMachine {
    /// Create a new state machine for restarting the named image.
    pub fn new(subject: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            subject: subject.into(),
            current: RestartPhase::Loading,
            started: now,
            last_transition: now,
            transition_count: 0,
        }
    }

    /// Get the current phase.
    pub fn phase(&self) -> RestartPhase {
        self.current
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Time since the attempt started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Attempt to move to a new phase.
    pub fn transition_to(&mut self, target: RestartPhase) -> Result<(), StateTransitionError> {
        if self.current.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                subject: self.subject.clone(),
                state: self.current.name(),
            });
        }

        if !self.current.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                subject: self.subject.clone(),
                from: self.current.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            image = %self.subject,
            from = self.current.name(),
            to = target.name(),
            phase_ms = self.last_transition.elapsed().as_millis() as u64,
            "Restart phase transition"
        );

        self.current = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }

    /// Move to `Failed` from any non-terminal phase.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            tracing::debug!(
                image = %self.subject,
                from = self.current.name(),
                "Restart aborted"
            );
            self.current = RestartPhase::Failed;
            self.last_transition = Instant::now();
            self.transition_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcpu_transitions() {
        use VcpuRunState::*;
        assert!(Running.can_transition_to(QuiesceRequested));
        assert!(QuiesceRequested.can_transition_to(Quiesced));
        assert!(QuiesceRequested.can_transition_to(Running));
        assert!(Quiesced.can_transition_to(Running));

        assert!(!Running.can_transition_to(Quiesced));
        assert!(!Quiesced.can_transition_to(QuiesceRequested));
    }

    #[test]
    fn test_restart_happy_path() {
        let mut sm = RestartStateMachine::new("test_snap.snap");
        assert_eq!(sm.phase(), RestartPhase::Loading);

        sm.transition_to(RestartPhase::Validating).unwrap();
        sm.transition_to(RestartPhase::Reconstructing).unwrap();
        sm.transition_to(RestartPhase::Resuming).unwrap();
        assert_eq!(sm.phase(), RestartPhase::Resuming);
        assert_eq!(sm.transition_count(), 3);

        // Terminal
        assert!(sm.transition_to(RestartPhase::Failed).is_err());
    }

    #[test]
    fn test_restart_cannot_skip_validation() {
        let mut sm = RestartStateMachine::new("img");
        assert!(sm.transition_to(RestartPhase::Reconstructing).is_err());
        assert_eq!(sm.phase(), RestartPhase::Loading);
    }

    #[test]
    fn test_restart_fail_is_terminal() {
        let mut sm = RestartStateMachine::new("img");
        sm.transition_to(RestartPhase::Validating).unwrap();
        sm.fail();
        assert_eq!(sm.phase(), RestartPhase::Failed);
        assert!(sm.transition_to(RestartPhase::Reconstructing).is_err());

        // Idempotent
        sm.fail();
        assert_eq!(sm.transition_count(), 2);
    }
}
