// CLI module - command-line argument parsing
//
// Subcommands map onto the library verbs: one-shot syncs, the schedule
// daemon, status inspection and config management.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// histmirror - mirror history tables into an embedded analytics store
#[derive(Parser)]
#[command(name = "histmirror")]
#[command(version = crate::config::VERSION)]
#[command(about = "History-table sync into an embedded analytics store", long_about = None)]
pub struct Cli {
    /// Path to a config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use a built-in in-memory demo source instead of the configured one
    #[arg(long, global = true)]
    pub demo: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync of a configured table
    Sync {
        /// Target table name from the config
        table: String,

        /// Force a full load instead of the default incremental
        #[arg(long)]
        full: bool,
    },

    /// Validate end-to-end plumbing with a disposable row-capped load
    Test {
        /// Target table name from the config
        table: String,

        /// Maximum rows to load
        #[arg(long, default_value_t = 1_000)]
        rows: u64,
    },

    /// Run the scheduler until interrupted
    Daemon,

    /// Show persisted sync state for one table
    Status { table: String },

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Write a fresh config file with defaults
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}
