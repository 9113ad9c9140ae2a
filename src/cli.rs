//! Command-line entrypoint (spec.md §4.15 [AMBIENT]).
//!
//! Grounded in the teacher's `clap`-derive `Cli`/`Commands` shape, trimmed
//! to the three subcommands this service actually needs -- `Run` (the
//! default, wiring up the whole engine), `Configcheck` (validate a config
//! file without connecting to anything, same purpose as the teacher's own
//! `Configcheck`), and `SlotStatus` (inspect the replication slot, grounded
//! in `replication/slot.rs`'s `slot_status`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "vibestack-sync", version, about = "Real-time bidirectional sync engine over PostgreSQL logical replication.")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "vibestack.toml")]
    pub config: PathBuf,

    /// Override the configured database URL.
    #[arg(long)]
    pub database_url: Option<String>,

    /// Override the configured listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Subcommand. Defaults to `Run`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the sync engine: connect, ensure the replication slot exists,
    /// and accept WebSocket sessions.
    Run,

    /// Parse the configuration file and report any errors, without
    /// connecting to the database.
    Configcheck,

    /// Print the current state of the configured replication slot.
    SlotStatus,
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Run
    }
}
