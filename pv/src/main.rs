//! Pipevisor - supervised dispatcher/worker pipeline
//!
//! CLI entry point for the watchdog, the two internal process roles, and the
//! management commands.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use pipevisor::cli::{Cli, Command, OutputFormat};
use pipevisor::config::Config;
use pipevisor::dispatcher::Dispatcher;
use pipevisor::process::{PidFile, Role, terminate_process};
use pipevisor::watchdog::Watchdog;
use pipevisor::worker::Worker;

fn setup_logging(name: &str, cli_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pipevisor")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > default (INFO)
    let level = if let Some(s) = cli_log_level {
        match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        }
    } else {
        tracing::Level::INFO
    };

    // Children run with null stdio, so logs go to per-role files
    let log_file = fs::File::create(log_dir.join(format!("{}.log", name))).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_name = match &cli.command {
        Command::Watchdog => "watchdog",
        Command::RunDispatcher => "dispatcher",
        Command::RunWorker => "worker",
        _ => "pv",
    };
    setup_logging(log_name, cli.log_level.as_deref())?;

    let config = Config::load(cli.config.as_ref())?;
    config.validate()?;

    match cli.command {
        Command::Watchdog => Watchdog::new(config, cli.config.clone())?.run().await,
        Command::RunDispatcher => Dispatcher::new(config, cli.config.clone()).run().await,
        Command::RunWorker => Worker::new(config).run().await,
        Command::Status { format } => show_status(&config, format),
        Command::Stop => stop_pipeline(&config).await,
        Command::Send { line } => send_line(&config, &line).await,
    }
}

/// One row of `pv status` output
#[derive(Debug, Serialize)]
struct StatusEntry {
    role: Role,
    pid: Option<u32>,
    running: bool,
}

fn show_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!("show_status: called");
    let dir = config.runtime_dir();

    let entries: Vec<StatusEntry> = [Role::Watchdog, Role::Dispatcher, Role::Worker]
        .into_iter()
        .map(|role| {
            let pid_file = PidFile::for_role(&dir, role);
            let pid = pid_file.read();
            StatusEntry {
                role,
                pid,
                running: pid_file.running_pid().is_some(),
            }
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries).context("Failed to serialize status")?);
        }
        OutputFormat::Text => {
            for entry in &entries {
                let state = match (entry.pid, entry.running) {
                    (Some(pid), true) => format!("running (pid {})", pid),
                    (Some(pid), false) => format!("dead (stale record, pid {})", pid),
                    (None, _) => "not running".to_string(),
                };
                println!("{:<12} {}", entry.role, state);
            }
        }
    }
    Ok(())
}

/// Stop a running pipeline: prefer the watchdog, fall back to a bare
/// dispatcher started without one
async fn stop_pipeline(config: &Config) -> Result<()> {
    debug!("stop_pipeline: called");
    let dir = config.runtime_dir();
    let grace = config.supervision.grace_period();

    for role in [Role::Watchdog, Role::Dispatcher] {
        if let Some(pid) = PidFile::for_role(&dir, role).running_pid() {
            println!("Stopping {} (pid {})...", role, pid);
            terminate_process(pid, grace).await;
            println!("Stopped");
            return Ok(());
        }
    }

    println!("Pipeline is not running");
    Ok(())
}

/// One-shot client: send a single line to the dispatcher, print the reply
async fn send_line(config: &Config, line: &str) -> Result<()> {
    let addr = config.listen.client_addr();
    debug!(%addr, %line, "send_line: called");

    let timeout = config.channel.reply_timeout() + Duration::from_secs(1);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .context("Timed out connecting to dispatcher")?
        .context(format!("Failed to connect to dispatcher at {}", addr))?;

    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .context("Failed to send line")?;

    let mut lines = BufReader::new(read_half).lines();
    let reply = tokio::time::timeout(timeout, lines.next_line())
        .await
        .context("Timed out waiting for reply")?
        .context("Failed to read reply")?
        .ok_or_else(|| eyre::eyre!("Dispatcher closed the connection without replying"))?;

    println!("{}", reply);
    Ok(())
}
