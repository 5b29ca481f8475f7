//! LiveBind CLI
//!
//! Command-line tools for trying binding declarations against a local
//! data fixture.
//!
//! # Commands
//!
//! - `sync` - Mirror a fixture through a binding file and print the stores
//! - `version` - Show version information

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LiveBind command-line tools.
#[derive(Parser)]
#[command(name = "livebind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a data fixture through a binding file
    Sync {
        /// Binding file (JSON)
        #[arg(short, long)]
        bindings: PathBuf,

        /// Remote data fixture (JSON)
        #[arg(short, long)]
        data: PathBuf,

        /// Push a value after the initial load, as PATH=JSON (repeatable)
        #[arg(short, long)]
        push: Vec<String>,

        /// Sign in as this user id before syncing
        #[arg(short, long)]
        user: Option<String>,

        /// Include the session status in the output
        #[arg(short, long)]
        status: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync {
            bindings,
            data,
            push,
            user,
            status,
        } => {
            let options = commands::sync::SyncOptions {
                pushes: push,
                user,
                status,
            };
            let output = commands::sync::run(&bindings, &data, &options)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Version => {
            println!("LiveBind CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("LiveBind Core v{}", livebind_core::VERSION);
        }
    }

    Ok(())
}
