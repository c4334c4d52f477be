//! CLI argument parsing for the keyindex operator tool.
//!
//! CLI flags override all other configuration sources.

use clap::{Parser, Subcommand};

/// keyindex operator tool
///
/// Inspects and maintains the secondary indices stored in a keyindex database.
#[derive(Parser, Debug)]
#[command(name = "keyindex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/keyindex/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show progress markers, entry counts and table versions
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List index entries
    Scan {
        /// Index name
        index: String,

        /// Only entries under this key (integers are parsed as such)
        #[arg(short, long)]
        key: Option<String>,

        /// Maximum number of entries to print
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Wipe an index so the next start rebuilds it
    Clear {
        /// Index name
        index: String,
    },

    /// Trigger RocksDB compaction
    Compact,
}
