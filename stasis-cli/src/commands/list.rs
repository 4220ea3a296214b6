// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasis list` command - List images in the snapshot directory.

use super::inspect::format_timestamp;
use stasis_core::ImageReader;

pub async fn execute(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let images = ImageReader::list(&config.directory)?;

    if images.is_empty() {
        println!("No images in {}.", config.directory.display());
        return Ok(());
    }

    println!("╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║                              SNAPSHOT IMAGES                                 ║");
    println!("╠═══════════════════╦═══════════════════════════╦══════╦═══════════════════════╣");
    println!("║ Label             ║ Created                   ║ Live ║ Description           ║");
    println!("╠═══════════════════╬═══════════════════════════╬══════╬═══════════════════════╣");

    for (_, header) in &images {
        let description: String = header.description.chars().take(21).collect();
        println!(
            "║ {:<17} ║ {:<25} ║ {:<4} ║ {:<21} ║",
            header.label.as_str(),
            format_timestamp(header.created_at_us),
            if header.live { "yes" } else { "no" },
            description
        );
    }

    println!("╚═══════════════════╩═══════════════════════════╩══════╩═══════════════════════╝");
    println!();
    println!("Total: {} image(s)", images.len());

    Ok(())
}
