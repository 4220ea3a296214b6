// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasis validate` command - Validate configuration file.

use stasis_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Snapshot Settings:");
            println!("  Directory:          {}", config.directory.display());
            println!(
                "  Descriptor Policy:  {}",
                if config.strict_descriptors {
                    "strict"
                } else {
                    "lenient"
                }
            );
            println!(
                "  Quiesce Timeout:    {}ms",
                config.quiesce_timeout.as_millis()
            );
            println!("  Capture Workers:    {}", config.capture_workers);
            println!("  Live Snapshots:     {}", config.live);
            if let Some(input) = &config.input_path {
                println!("  Input File:         {}", input.display());
            }
            if let Some(output) = &config.output_path {
                println!("  Output File:        {}", output.display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
