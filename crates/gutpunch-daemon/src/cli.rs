//! Command-line surface of the `gutpunch` binary.

use clap::{Parser, Subcommand};

/// GutPunch job scheduler
///
/// Durable single-node job scheduling on SQLite.
#[derive(Parser, Debug)]
#[command(name = "gutpunch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides GUTPUNCH_CONFIG and ~/.gutpunch/gutpunch.toml)
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
    /// Register built-in handlers and poll until Ctrl-C
    Run,

    /// Run a single poll tick and print its report
    Tick,

    /// Insert a job
    Enqueue {
        /// Handler name (built-ins: log, fail)
        name: String,

        /// Parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Delay in seconds before the job is due
        #[arg(long, conflicts_with = "at")]
        in_secs: Option<i64>,

        /// Absolute due time (RFC 3339)
        #[arg(long)]
        at: Option<String>,

        /// Queue to place the job in
        #[arg(short, long)]
        queue: Option<String>,

        /// Attempts before the job is retired
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// List jobs
    Jobs {
        /// Only jobs in this status (pending, running, completed, failed, dead)
        #[arg(short, long)]
        status: Option<String>,

        /// Only jobs in this queue
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Queue management
    Queues {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Run every pending job of a queue now
    Drain {
        /// Queue name
        queue: String,
    },

    /// Job counts per status
    Stats,
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueueCommands {
    /// List queues in dispatch order
    List,

    /// Create a queue
    Create {
        name: String,

        /// Lower runs first
        #[arg(short, long, default_value = "0")]
        priority: i64,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Change a queue's name, priority or description
    Update {
        name: String,

        #[arg(long)]
        rename: Option<String>,

        #[arg(short, long)]
        priority: Option<i64>,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Delete a queue (its jobs are kept)
    Delete { name: String },
}
