// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasis restore` command - Restart the counter guest from an image.

use std::sync::Arc;

use crate::counter::Counter;
use stasis_core::{GuestExit, ImageReader, RestartLoader};

pub async fn execute(
    config_path: Option<&str>,
    image: &str,
    input: Option<String>,
    output: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;
    if let Some(input) = input {
        config = config.with_input_path(input);
    }
    if let Some(output) = output {
        config = config.with_output_path(output);
    }

    let path = ImageReader::resolve(&config.directory, image);
    let header = ImageReader::read_header(&path)?;
    tracing::info!(path = %path.display(), label = %header.label, "Restoring guest");

    let restarted = RestartLoader::new(config)
        .restart(&path, Arc::new(Counter::new(header.label.as_str())))?;
    let report = restarted.report.clone();

    println!("✓ Restored '{}' from {}", report.label, report.image.display());
    println!(
        "  Threads: {}, Regions: {}, Memory: {} bytes, took {}ms",
        report.threads,
        report.regions,
        report.memory_bytes,
        report.elapsed.as_millis()
    );
    for fd in &report.closed {
        println!("  ! fd {} was closed at snapshot time", fd);
    }
    for (fd, reason) in &report.unavailable {
        println!("  ! fd {} not restored: {}", fd, reason);
    }

    let guest = restarted.guest;
    let (exit, state) = tokio::task::spawn_blocking(move || {
        let exit = guest.wait();
        (exit, Counter::state(guest.memory()))
    })
    .await?;
    let state = state?;

    match exit {
        GuestExit::Exited(code) => {
            println!(
                "✓ Guest finished with status {} at count {} (limit {})",
                code, state.count, state.limit
            );
            Ok(())
        }
        GuestExit::Snapshotted { path } => {
            println!("✓ Guest snapshotted again to {}", path.display());
            Ok(())
        }
        GuestExit::Terminated => {
            eprintln!("✗ Restored guest was terminated");
            std::process::exit(1);
        }
    }
}
