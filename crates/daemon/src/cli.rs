//! Command-line interface for fsmonitord.
//!
//! Provides commands for starting, stopping, and querying the daemon.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fsmonitor daemon - records worktree changes and answers "what changed since" queries
#[derive(Debug, Parser)]
#[command(name = "fsmonitord")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "FSMONITORD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "FSMONITORD_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Start {
        /// Worktree root to watch
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Override endpoint path
        #[arg(short, long, env = "FSMONITOR_ENDPOINT")]
        endpoint: Option<PathBuf>,

        /// Poll the worktree every N seconds instead of using native events
        #[arg(short = 'i', long)]
        poll_interval: Option<u64>,
    },

    /// Ask the running daemon to quit
    Stop {
        /// Override endpoint path
        #[arg(short, long, env = "FSMONITOR_ENDPOINT")]
        endpoint: Option<PathBuf>,
    },

    /// Show whether a daemon is running
    Status {
        /// Override endpoint path
        #[arg(short, long, env = "FSMONITOR_ENDPOINT")]
        endpoint: Option<PathBuf>,
    },

    /// Print paths changed since a timestamp
    Query {
        /// Nanoseconds since the Unix epoch
        #[arg(short, long)]
        since: u64,

        /// Protocol version to send
        #[arg(long, default_value_t = fsmonitord::query::PROTOCOL_VERSION)]
        protocol_version: u64,

        /// Override endpoint path
        #[arg(short, long, env = "FSMONITOR_ENDPOINT")]
        endpoint: Option<PathBuf>,
    },

    /// Exit successfully if this platform has a native backend
    IsSupported,
}

impl Cli {
    /// Get the endpoint override from command arguments, if any
    pub fn endpoint(&self) -> Option<PathBuf> {
        match &self.command {
            Command::Start { endpoint, .. }
            | Command::Stop { endpoint }
            | Command::Status { endpoint }
            | Command::Query { endpoint, .. } => endpoint.clone(),
            Command::IsSupported => None,
        }
    }
}
