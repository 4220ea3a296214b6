// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasis inspect` command - Validate an image and print its contents.

use chrono::{DateTime, Utc};
use serde::Serialize;
use stasis_core::image::{DescriptorKind, PipeEnd, RegionKind};
use stasis_core::{ImageReader, SnapshotImage};

/// JSON form of an inspected image.
#[derive(Serialize)]
struct InspectReport<'a> {
    path: String,
    created_at: String,
    memory_bytes: u64,
    image: &'a SnapshotImage,
}

/// Render an image timestamp (microseconds since the epoch).
pub fn format_timestamp(created_at_us: u64) -> String {
    i64::try_from(created_at_us)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn describe_region(kind: &RegionKind) -> String {
    match kind {
        RegionKind::Anonymous { name: Some(name) } => format!("anon [{}]", name),
        RegionKind::Anonymous { name: None } => "anon".to_string(),
        RegionKind::File { path, offset } => format!("file {} @ {:#x}", path.display(), offset),
        RegionKind::Guard => "guard".to_string(),
    }
}

fn describe_descriptor(kind: &DescriptorKind) -> String {
    match kind {
        DescriptorKind::File { path, offset } => {
            format!("{} (offset {})", path.display(), offset)
        }
        DescriptorKind::Directory { path } | DescriptorKind::CharDevice { path } => {
            path.display().to_string()
        }
        DescriptorKind::Pipe { end, peer } => {
            let end = match end {
                PipeEnd::Read => "read end",
                PipeEnd::Write => "write end",
            };
            match peer {
                Some(peer) => format!("{}, peer fd {}", end, peer),
                None => format!("{}, peer not held", end),
            }
        }
        DescriptorKind::Listener { endpoint } => endpoint.to_string(),
        DescriptorKind::Closed { was, reason } => format!("was {}: {}", was, reason),
    }
}

pub async fn execute(
    config_path: Option<&str>,
    image: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let path = ImageReader::resolve(&config.directory, image);
    tracing::debug!(path = %path.display(), "Inspecting image");

    let image = ImageReader::open(&path)?;
    let created_at = format_timestamp(image.header.created_at_us);

    if json {
        let report = InspectReport {
            path: path.display().to_string(),
            created_at,
            memory_bytes: image.memory_bytes(),
            image: &image,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let header = &image.header;
    println!("Image: {}", path.display());
    println!("  Label:          {}", header.label);
    println!("  Description:    {}", header.description);
    println!("  Format Version: {}", header.version);
    println!("  Architecture:   {:?}", header.arch);
    println!("  Program:        {}", image.metadata.program);
    println!("  Created:        {}", created_at);
    println!("  Live:           {}", header.live);
    println!();

    println!(
        "Memory ({} regions, {} bytes):",
        image.memory.len(),
        image.memory_bytes()
    );
    for region in &image.memory {
        println!(
            "  {:#014x}-{:#014x} {} {}",
            region.start,
            region.end(),
            region.permissions,
            describe_region(&region.kind)
        );
    }
    println!();

    println!("Threads ({}):", image.execution.threads.len());
    for thread in &image.execution.threads {
        println!(
            "  vcpu-{:<3} rip={:#x} rsp={:#x} pending={:?} blocked={:?}{}",
            thread.thread_id,
            thread.registers.instruction_pointer(),
            thread.registers.stack_pointer(),
            thread.pending_signals,
            thread.blocked_signals,
            if thread.continuation { " [continues]" } else { "" }
        );
    }
    println!();

    println!("Descriptors ({}):", image.descriptors.len());
    for (fd, entry) in image.descriptors.iter() {
        println!(
            "  {:<4} {:<11} {}{}",
            fd.value(),
            entry.kind.type_name(),
            describe_descriptor(&entry.kind),
            if entry.required { " (required)" } else { "" }
        );
    }

    if !image.signals.is_empty() {
        println!();
        println!("Signal Handlers ({}):", image.signals.len());
        for (signo, disposition) in &image.signals {
            println!(
                "  {:<3} handler={:#x} flags={:#x}",
                signo, disposition.handler, disposition.flags
            );
        }
    }

    if !image.metadata.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &image.metadata.warnings {
            println!("  ! {}", warning);
        }
    }

    Ok(())
}
