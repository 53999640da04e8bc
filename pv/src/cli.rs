//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Pipevisor - supervised dispatcher/worker pipeline
#[derive(Parser)]
#[command(
    name = "pv",
    about = "Supervised dispatcher/worker pipeline with watchdog liveness probing",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the watchdog: spawn the pipeline and supervise it
    Watchdog,

    /// Internal: run as the dispatcher process (spawned by `watchdog`)
    #[command(hide = true)]
    RunDispatcher,

    /// Internal: run as the worker process (spawned by the dispatcher)
    #[command(hide = true)]
    RunWorker,

    /// Show pipeline status from the published pid records
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stop a running pipeline gracefully
    Stop,

    /// Send one command line to the dispatcher and print the reply
    Send {
        /// The line to send (e.g. "ping", or "QUIT" to drain the pipeline)
        line: String,
    },
}

/// Output format for status
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
