//! Custom error types for Stasis.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{GuestFd, VcpuId};

/// Top-level error type for the snapshot engine.
/// All errors are explicit variants - no catch-all or generic handling.
#[derive(Debug, Error)]
pub enum StasisError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Snapshot / Restart Errors
    // =========================================================================
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    // =========================================================================
    // Guest Errors
    // =========================================================================
    #[error("Guest error: {0}")]
    Guest(#[from] GuestError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors reject a configuration before anything runs.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// State transition errors for the vCPU and restart state machines.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition {subject} from {from} to {to}")]
    InvalidTransition {
        subject: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("{subject} is in terminal state: {state}")]
    TerminalState {
        subject: String,
        state: &'static str,
    },
}

/// Snapshot and restart failures.
///
/// Failures while taking a snapshot are recovered locally (the guest keeps
/// running); failures while restarting abort the restart.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Invalid snapshot label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("Another snapshot is already in progress for this guest")]
    SnapshotInProgress,

    #[error("Guest did not quiesce within {timeout_ms}ms (still running: {pending:?})")]
    QuiesceTimeout {
        timeout_ms: u64,
        pending: Vec<VcpuId>,
    },

    #[error("Capture failed: {reason}")]
    CaptureFailed { reason: String },

    #[error("Unsupported resource on descriptor {fd}: {reason}")]
    UnsupportedResource { fd: GuestFd, reason: String },

    #[error("Failed to write snapshot image {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Incompatible snapshot image: {reason}")]
    IncompatibleFormat { reason: String },

    #[error("Resource for descriptor {fd} unavailable: {reason}")]
    ResourceUnavailable { fd: GuestFd, reason: String },

    #[error("Snapshot image not found: {path}")]
    ImageNotFound { path: PathBuf },

    #[error("Failed to reconstruct guest: {reason}")]
    ReconstructFailed { reason: String },
}

/// Errors raised by the guest host: memory faults, descriptor misuse and
/// failed host system calls.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("Guest mapping {start:#x}+{length:#x} overlaps an existing region")]
    Overlap { start: u64, length: u64 },

    #[error("Guest address or length {value:#x} is not page aligned")]
    Unaligned { value: u64 },

    #[error("Guest {access} fault at {addr:#x}")]
    Fault { addr: u64, access: &'static str },

    #[error("No guest mapping starts at {start:#x}")]
    NoMapping { start: u64 },

    #[error("Bad guest descriptor {fd}")]
    BadDescriptor { fd: GuestFd },

    #[error("Guest descriptor {fd} is already in use")]
    DescriptorInUse { fd: GuestFd },

    #[error("Invalid signal number {signo}")]
    InvalidSignal { signo: i32 },

    #[error("System call {syscall} failed: {source}")]
    Os {
        syscall: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("No guest thread {id}")]
    NoSuchVcpu { id: VcpuId },

    #[error("Failed to spawn vCPU thread: {reason}")]
    SpawnFailed { reason: String },

    #[error("Guest is exiting")]
    Exiting,
}

impl GuestError {
    /// Wrap a failed `nix` call.
    pub fn os(syscall: &'static str, source: nix::Error) -> Self {
        Self::Os { syscall, source }
    }
}

/// Result type alias using StasisError.
pub type StasisResult<T> = Result<T, StasisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "directory",
            context: "snapshot section".to_string(),
        };
        assert!(err.to_string().contains("directory"));
        assert!(err.to_string().contains("snapshot section"));
    }

    #[test]
    fn test_error_chain() {
        let snapshot_err = SnapshotError::SnapshotInProgress;
        let err: StasisError = snapshot_err.into();
        assert!(matches!(
            err,
            StasisError::Snapshot(SnapshotError::SnapshotInProgress)
        ));
    }

    #[test]
    fn test_quiesce_timeout_lists_pending_threads() {
        let err = SnapshotError::QuiesceTimeout {
            timeout_ms: 50,
            pending: vec![VcpuId::new(2), VcpuId::new(3)],
        };
        let text = err.to_string();
        assert!(text.contains("50ms"));
        assert!(text.contains("vcpu-2"));
    }
}
