// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stasis CLI
//!
//! Command-line interface for the Stasis process snapshot engine.

use clap::{Parser, Subcommand};

mod commands;
mod counter;

/// Stasis - snapshot a running guest and restart it from a durable image
#[derive(Parser)]
#[command(name = "stasis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults are used when absent)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// Print the contents of a snapshot image
    Inspect {
        /// Image label or path
        image: String,

        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// List images in the snapshot directory
    List,

    /// Run the built-in counter guest and snapshot it
    Demo {
        /// Label of the snapshot
        #[arg(short, long, default_value = "demo")]
        label: String,

        /// Iteration at which the guest takes its snapshot
        #[arg(long, default_value_t = 1000)]
        take_at: u64,

        /// Iteration at which the guest exits
        #[arg(short, long, default_value_t = 2000)]
        iterations: u64,

        /// Keep the guest running after the snapshot
        #[arg(long)]
        live: bool,
    },

    /// Restart the counter guest from an image
    Restore {
        /// Image label or path
        image: String,

        /// File the restarted guest reads extra iterations from
        #[arg(long)]
        input: Option<String>,

        /// File the restarted guest writes its final count to
        #[arg(long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Validate { file } => commands::validate::execute(&file).await,
        Commands::Inspect { image, json } => commands::inspect::execute(config, &image, json).await,
        Commands::List => commands::list::execute(config).await,
        Commands::Demo {
            label,
            take_at,
            iterations,
            live,
        } => commands::demo::execute(config, &label, take_at, iterations, live).await,
        Commands::Restore {
            image,
            input,
            output,
        } => commands::restore::execute(config, &image, input, output).await,
    }
}
