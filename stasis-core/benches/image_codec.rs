// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Image codec and memory capture microbenchmarks.
//!
//! Measures encode/decode throughput of the image format and the parallel
//! memory copy at various address space sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stasis_core::capture;
use stasis_core::guest::{GuestMemory, GUEST_PAGE_SIZE};
use stasis_core::image::format;
use stasis_core::image::{
    DescriptorTable, ExecutionState, ImageHeader, ImageMetadata, MemoryRegion, RegionKind,
    ThreadState,
};
use stasis_core::{Protection, RegisterFile, SnapshotImage, SnapshotLabel};
use std::collections::BTreeMap;
use std::time::Duration;

/// Address space sizes to benchmark (in pages).
const SIZES_IN_PAGES: &[u64] = &[16, 256, 4096];

fn image_with_pages(pages: u64) -> SnapshotImage {
    let length = pages * GUEST_PAGE_SIZE;
    SnapshotImage {
        header: ImageHeader::new(SnapshotLabel::new("bench").unwrap(), "codec bench", true),
        metadata: ImageMetadata {
            program: "bench".to_string(),
            warnings: Vec::new(),
        },
        memory: vec![MemoryRegion {
            start: 0x100000,
            length,
            permissions: Protection::READ_WRITE,
            kind: RegionKind::Anonymous { name: None },
            contents: (0..length).map(|i| (i % 253) as u8).collect(),
        }],
        execution: ExecutionState {
            threads: vec![ThreadState {
                thread_id: 0,
                registers: RegisterFile::at_entry(0x401000, 0x7fff_0000),
                pending_signals: Default::default(),
                blocked_signals: Default::default(),
                continuation: true,
            }],
        },
        descriptors: DescriptorTable::new(),
        signals: BTreeMap::new(),
    }
}

/// Benchmark image encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_encode");
    group.measurement_time(Duration::from_secs(5));

    for &pages in SIZES_IN_PAGES {
        let image = image_with_pages(pages);
        group.throughput(Throughput::Bytes(pages * GUEST_PAGE_SIZE));

        group.bench_with_input(BenchmarkId::from_parameter(pages), &image, |b, image| {
            let mut out = Vec::with_capacity((pages * GUEST_PAGE_SIZE) as usize + 4096);
            b.iter(|| {
                out.clear();
                format::encode(black_box(image), &mut out).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark image decoding, including checksum and invariant checks.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_decode");
    group.measurement_time(Duration::from_secs(5));

    for &pages in SIZES_IN_PAGES {
        let mut bytes = Vec::new();
        format::encode(&image_with_pages(pages), &mut bytes).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(pages), &bytes, |b, bytes| {
            b.iter(|| black_box(format::decode(&mut bytes.as_slice()).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark memory capture with 1 and 4 workers over 16 regions.
fn bench_memory_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_capture");
    group.measurement_time(Duration::from_secs(5));

    let memory = GuestMemory::new();
    let region_pages = 256;
    for i in 0..16u64 {
        let start = 0x1000_0000 + i * region_pages * GUEST_PAGE_SIZE * 2;
        memory
            .map_anonymous(start, region_pages * GUEST_PAGE_SIZE, Protection::READ_WRITE)
            .unwrap();
        memory.write_u64(start, i).unwrap();
    }
    group.throughput(Throughput::Bytes(16 * region_pages * GUEST_PAGE_SIZE));

    for workers in [1usize, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| black_box(capture::memory::capture(&memory, workers).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_memory_capture);
criterion_main!(benches);
