// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Address space capture.

use std::thread;

use crate::error::SnapshotError;
use crate::guest::memory::{GuestMemory, GuestRegion};
use crate::image::MemoryRegion;

/// Copy every region of a quiesced guest, splitting the copy across up to
/// `workers` threads. Regions come out in address order.
pub fn capture(memory: &GuestMemory, workers: usize) -> Result<Vec<MemoryRegion>, SnapshotError> {
    let regions = memory.regions();
    let jobs: Vec<&GuestRegion> = regions.values().collect();

    for region in &jobs {
        region
            .verify_readable()
            .map_err(|reason| SnapshotError::CaptureFailed { reason })?;
    }

    let contents = if workers <= 1 || jobs.len() <= 1 {
        jobs.iter().map(|r| r.contents().to_vec()).collect()
    } else {
        copy_parallel(&jobs, workers)?
    };

    let captured: Vec<MemoryRegion> = jobs
        .iter()
        .zip(contents)
        .map(|(region, contents)| MemoryRegion {
            start: region.start(),
            length: region.length(),
            permissions: region.protection(),
            kind: region.kind(),
            contents,
        })
        .collect();

    tracing::debug!(
        regions = captured.len(),
        bytes = captured.iter().map(|r| r.contents.len()).sum::<usize>(),
        workers,
        "Captured guest memory"
    );

    Ok(captured)
}

/// Assign regions to workers, largest first, each to the least loaded worker.
fn partition(jobs: &[&GuestRegion], workers: usize) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..jobs.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(jobs[i].contents().len()));

    let mut buckets: Vec<(u64, Vec<usize>)> = vec![(0, Vec::new()); workers.min(jobs.len())];
    for i in order {
        if let Some(bucket) = buckets.iter_mut().min_by_key(|(load, _)| *load) {
            bucket.0 += jobs[i].contents().len() as u64;
            bucket.1.push(i);
        }
    }
    buckets.into_iter().map(|(_, indices)| indices).collect()
}

fn copy_parallel(jobs: &[&GuestRegion], workers: usize) -> Result<Vec<Vec<u8>>, SnapshotError> {
    let mut contents = vec![Vec::new(); jobs.len()];

    thread::scope(|scope| {
        let mut handles = Vec::new();
        for (n, bucket) in partition(jobs, workers).into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("stasis-capture-{}", n))
                .spawn_scoped(scope, move || {
                    bucket
                        .into_iter()
                        .map(|i| (i, jobs[i].contents().to_vec()))
                        .collect::<Vec<_>>()
                })
                .map_err(|e| SnapshotError::CaptureFailed {
                    reason: format!("cannot start capture worker: {}", e),
                })?;
            handles.push(handle);
        }

        for handle in handles {
            let copied = handle.join().map_err(|_| SnapshotError::CaptureFailed {
                reason: "capture worker panicked".to_string(),
            })?;
            for (i, bytes) in copied {
                contents[i] = bytes;
            }
        }
        Ok::<_, SnapshotError>(())
    })?;

    Ok(contents)
}
