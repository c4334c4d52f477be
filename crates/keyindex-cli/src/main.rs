//! keyindex operator tool
//!
//! Inspects and maintains an on-disk keyindex database.
//!
//! # Usage
//!
//! ```bash
//! keyindex status [--json]
//! keyindex scan <INDEX> [--key KEY] [--limit N]
//! keyindex clear <INDEX>
//! keyindex compact
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/keyindex/config.toml)
//! 3. Environment variables (KEYINDEX_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use keyindex_cli::{clear_index, compact, init_logging, load_settings, scan_index, show_status, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_logging(&settings.log_level)?;

    let db_path = settings.expanded_db_path();
    match cli.command {
        Commands::Status { json } => {
            show_status(&db_path, json)?;
        }
        Commands::Scan { index, key, limit } => {
            scan_index(&db_path, &index, key.as_deref(), limit)?;
        }
        Commands::Clear { index } => {
            clear_index(&db_path, &index)?;
        }
        Commands::Compact => {
            compact(&db_path)?;
        }
    }

    Ok(())
}
