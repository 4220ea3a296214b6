// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasis demo` command - Run the counter guest and snapshot it.

use std::sync::Arc;

use crate::counter::Counter;
use stasis_core::{Guest, GuestExit, SnapshotLabel};

pub async fn execute(
    config_path: Option<&str>,
    label: &str,
    take_at: u64,
    iterations: u64,
    live: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let config = if live { config.with_live(true) } else { config };
    let label = SnapshotLabel::new(label)?;

    if take_at == 0 || take_at > iterations {
        return Err(format!(
            "--take-at must be between 1 and --iterations ({}), got {}",
            iterations, take_at
        )
        .into());
    }

    tracing::info!(
        label = %label,
        take_at,
        iterations,
        live = config.live,
        directory = %config.directory.display(),
        "Starting counter guest"
    );

    let guest = Guest::new(Arc::new(Counter::new(label.as_str())), config);
    Counter::prepare(&guest, take_at, iterations)?;
    guest.start(Counter::entry())?;

    let (exit, state) = tokio::task::spawn_blocking(move || {
        let exit = guest.wait();
        (exit, Counter::state(guest.memory()))
    })
    .await?;
    let state = state?;

    match exit {
        GuestExit::Snapshotted { path } => {
            println!("✓ Snapshot '{}' taken at iteration {}", label, state.count);
            println!("  Image: {}", path.display());
            println!("  Guest terminated; resume it with `stasis restore {}`", label);
        }
        GuestExit::Exited(code) if state.status == 0 => {
            println!("✓ Snapshot '{}' taken at iteration {}", label, take_at);
            println!(
                "  Guest kept running and exited with status {} after {} iterations",
                code, state.count
            );
        }
        GuestExit::Exited(code) => {
            eprintln!("✗ Snapshot '{}' failed inside the guest", label);
            eprintln!(
                "  Guest exited with status {} after {} iterations",
                code, state.count
            );
            std::process::exit(1);
        }
        GuestExit::Terminated => {
            eprintln!("✗ Guest was terminated before finishing");
            std::process::exit(1);
        }
    }

    Ok(())
}
