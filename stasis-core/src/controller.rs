// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Process controller: runs one snapshot end to end.
//!
//! Order of operations: validate label, claim the in-flight slot, quiesce,
//! capture memory, execution state and descriptors, write the image, then
//! either terminate the guest or resume it. A failure at any step resumes
//! every thread and leaves no image behind.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::capture;
use crate::error::SnapshotError;
use crate::guest::vcpu::RegisterFile;
use crate::guest::{GuestExit, GuestInner};
use crate::image::{ImageHeader, ImageMetadata, SnapshotImage, SnapshotWriter};
use crate::types::{SnapshotLabel, VcpuId};

/// The thread that requested a snapshot and its live registers.
#[derive(Debug)]
pub struct Initiator<'a> {
    pub id: VcpuId,
    pub registers: &'a RegisterFile,
}

/// Result of a successful snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub label: SnapshotLabel,
    pub path: PathBuf,
    pub image_bytes: u64,
    pub memory_bytes: u64,
    /// Descriptors closed in non-strict mode.
    pub warnings: Vec<String>,
    /// The guest was terminated after the image was written.
    pub terminated: bool,
    pub elapsed: Duration,
}

/// Releases the in-flight slot when a snapshot attempt ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serializes snapshot attempts for one guest. At most one is in flight;
/// concurrent requests fail fast with [`SnapshotError::SnapshotInProgress`].
#[derive(Debug, Default)]
pub struct ProcessController {
    in_flight: AtomicBool,
}

impl ProcessController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot is currently being taken.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<InFlight<'_>, SnapshotError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InFlight(&self.in_flight))
            .map_err(|_| SnapshotError::SnapshotInProgress)
    }

    pub(crate) fn take(
        &self,
        guest: &GuestInner,
        initiator: Option<Initiator<'_>>,
        label: &str,
        description: &str,
        live: bool,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let started = Instant::now();
        let result = self.run(guest, initiator, label, description, live, started);

        match &result {
            Ok(outcome) => tracing::info!(
                label = %outcome.label,
                path = %outcome.path.display(),
                image_bytes = outcome.image_bytes,
                memory_bytes = outcome.memory_bytes,
                dropped = outcome.warnings.len(),
                terminated = outcome.terminated,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Snapshot written"
            ),
            Err(e) => tracing::warn!(
                label,
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Snapshot failed; guest continues"
            ),
        }

        result
    }

    fn run(
        &self,
        guest: &GuestInner,
        initiator: Option<Initiator<'_>>,
        label: &str,
        description: &str,
        live: bool,
        started: Instant,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let label = SnapshotLabel::new(label)?;
        let _in_flight = self.claim()?;

        if guest.is_exiting() {
            return Err(SnapshotError::CaptureFailed {
                reason: "guest is exiting".to_string(),
            });
        }

        let config = &guest.config;
        let writer = SnapshotWriter::new(&config.directory)?;

        tracing::debug!(
            label = %label,
            initiator = ?initiator.as_ref().map(|i| i.id),
            live,
            "Snapshot requested"
        );

        let quiesced = guest
            .barrier
            .quiesce(initiator.as_ref().map(|i| i.id), config.quiesce_timeout)?;

        let memory = capture::memory::capture(&guest.memory, config.capture_workers)?;
        let execution = capture::execution::capture(&guest.vcpu_slots(), initiator.as_ref())?;
        let descriptors = capture::descriptors::capture(&guest.fds, config.strict_descriptors)?;
        let signals = guest.signals.snapshot();

        let image = SnapshotImage {
            header: ImageHeader::new(label.clone(), description, live),
            metadata: ImageMetadata {
                program: guest.program.name().to_string(),
                warnings: descriptors.warnings,
            },
            memory,
            execution,
            descriptors: descriptors.table,
            signals,
        };
        image.validate()?;

        let written = writer.write(&image)?;

        if !live {
            // Exit is recorded before any thread resumes
            guest.request_exit(GuestExit::Snapshotted {
                path: written.path.clone(),
            });
        }
        drop(quiesced);

        Ok(SnapshotOutcome {
            label,
            path: written.path,
            image_bytes: written.bytes,
            memory_bytes: image.memory_bytes(),
            warnings: image.metadata.warnings,
            terminated: !live,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let controller = ProcessController::new();
        let first = controller.claim().unwrap();
        assert!(controller.is_busy());
        assert!(matches!(
            controller.claim(),
            Err(SnapshotError::SnapshotInProgress)
        ));
        drop(first);
        assert!(!controller.is_busy());
        assert!(controller.claim().is_ok());
    }
}
