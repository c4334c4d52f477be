//! keyindex operator library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (status, scan, clear, compact)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
pub use commands::{
    clear_index, collect_status, compact, init_logging, load_settings, read_entries, scan_index,
    show_status, DbStatus, IndexSummary, ScannedEntry, TableSummary,
};
