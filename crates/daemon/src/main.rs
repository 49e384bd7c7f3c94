//! fsmonitor daemon
//!
//! Watches a worktree and answers "what changed since" queries from
//! short-lived clients over a Unix domain socket or a Windows named pipe.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use color_eyre::eyre::{Result, bail};
use fsmonitor_ipc::{HAS_NATIVE_TRANSPORT, NativeTransport, Transport};
use fsmonitord::client;
use fsmonitord::{Config, Daemon, NotifyWatcher, Query, QueryReply};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_deref())?
        .with_endpoint(cli.endpoint())
        .with_log_level(cli.log_level.clone());

    // Only the daemon logs at the configured level; client commands stay quiet
    match &cli.command {
        Command::Start { .. } => {
            init_logging(&config.daemon.log_level)?;
        }
        _ => {
            init_logging("warn")?;
        }
    }

    match cli.command {
        Command::Start {
            root,
            poll_interval,
            ..
        } => {
            let config = config.with_root(root).with_poll_interval(poll_interval);
            cmd_start(config).await
        }
        Command::Stop { .. } => cmd_stop(&config).await,
        Command::Status { .. } => cmd_status(&config),
        Command::Query {
            since,
            protocol_version,
            ..
        } => cmd_query(&config, since, protocol_version).await,
        Command::IsSupported => cmd_is_supported(),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn transport(config: &Config) -> NativeTransport {
    NativeTransport::with_options(config.endpoint(), config.transport_options())
}

async fn cmd_start(config: Config) -> Result<()> {
    let transport = transport(&config);
    let endpoint = transport.endpoint().clone();

    if transport.is_live().await {
        bail!("fsmonitor daemon is already running at {endpoint}");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %endpoint,
        root = %config.watch.root.display(),
        "Starting fsmonitord"
    );

    let watcher = NotifyWatcher::new(config.watch.root.clone())
        .with_poll_interval(config.poll_interval())
        .with_ignore(config.watch_ignores(&endpoint));

    let daemon = Daemon::new(transport);

    // Dropping the daemon future on a signal removes the endpoint and stops the watcher.
    tokio::select! {
        result = daemon.run(watcher) => result?,
        signal = shutdown_signal() => {
            tracing::info!(signal = signal?, "Received signal, shutting down");
        }
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => Ok("SIGTERM"),
            _ = sigint.recv() => Ok("SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

async fn cmd_stop(config: &Config) -> Result<()> {
    let transport = transport(config);
    let endpoint = transport.endpoint().clone();

    if !client::is_running(&transport) {
        println!("fsmonitor daemon is not running");
        return Ok(());
    }

    if let Err(e) = client::request_quit(&transport).await {
        if e.is_not_running() {
            println!("fsmonitor daemon is not running (stale endpoint at {endpoint})");
            return Ok(());
        }
        return Err(e.into());
    }

    // The endpoint disappears once the accept loop has wound down.
    let deadline = Instant::now() + config.transport_options().connect_timeout;
    while client::is_running(&transport) {
        if Instant::now() >= deadline {
            bail!("fsmonitor daemon at {endpoint} did not stop");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!("fsmonitor daemon at {endpoint} stopped");
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let endpoint: PathBuf = config.endpoint().path().to_path_buf();

    if client::is_running(&transport(config)) {
        println!("fsmonitor daemon is running at {}", endpoint.display());
    } else {
        println!("fsmonitor daemon is not running");
    }
    Ok(())
}

async fn cmd_query(config: &Config, since: u64, protocol_version: u64) -> Result<()> {
    let transport = transport(config);
    let query = Query {
        version: protocol_version,
        since,
    };

    match client::send_query(&transport, query).await? {
        QueryReply::Rescan => bail!("rescan required"),
        QueryReply::Changed(paths) => {
            for path in paths {
                println!("{path}");
            }
        }
    }
    Ok(())
}

fn cmd_is_supported() -> Result<()> {
    if !HAS_NATIVE_TRANSPORT {
        bail!("no native fsmonitor daemon available on this platform");
    }
    Ok(())
}
