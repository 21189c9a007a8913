//! Pulse daemon entrypoint.
//!
//! Receives OTLP telemetry from assistant CLIs on localhost, tracks each session's state,
//! and keeps a deduplicated session list on disk for status displays to read.

use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod broadcast;
mod config;
mod loops;
mod notifier;
mod output;
mod process_monitor;
mod reducer;
mod server;
mod timers;
mod tokens;
mod tracker;
mod window;

use config::{DaemonConfig, Overrides};
use output::FileSink;
use process_monitor::{ProcessMonitor, SysinfoSource};
use tracker::{SessionTracker, TrackerSettings};

#[derive(Debug, Parser)]
#[command(name = "pulse-daemon", version, about)]
struct Cli {
    /// Config file (default: ~/.pulse/daemon.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Where the session list is written (default: ~/.pulse/sessions.json).
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            config_path: self.config.clone(),
            port: self.port,
            output_path: self.output.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = config::resolve(&Overrides::from_env().overlay(cli.overrides()));
    let output_path = match config.resolved_output_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve session list path");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let tracker = Arc::new(SessionTracker::new(
        TrackerSettings::from_config(&config),
        window::resolver_from_config(&config.window),
        notifier::notifier_from_config(config.notify_on_completion, &config.notify),
        Arc::new(FileSink::new(output_path.clone())),
        shutdown.clone(),
    ));

    let address = config.listen_address();
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, address = %address, "Failed to bind OTLP listener");
            std::process::exit(1);
        }
    };

    info!(
        address = %address,
        output = %output_path.display(),
        quiet_period_secs = config.quiet_period_secs,
        completed_timeout_secs = config.completed_timeout_secs,
        process_fallback = config.process_fallback,
        "Pulse daemon started"
    );

    // Publish an empty list right away so readers never see a stale file from a previous run.
    tracker.broadcast();
    spawn_background(&tracker, &config, &shutdown);

    let app = server::router(Arc::clone(&tracker));
    let signal_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal_token.cancel();
        })
        .await;
    if let Err(err) = served {
        warn!(error = %err, "HTTP server stopped with an error");
    }

    tracker.shutdown();
    info!("Pulse daemon stopped");
}

fn spawn_background(tracker: &Arc<SessionTracker>, config: &DaemonConfig, shutdown: &CancellationToken) {
    loops::spawn_broadcast_loop(
        Arc::clone(tracker),
        config.broadcast_interval(),
        shutdown.clone(),
    );
    loops::spawn_orphan_sweep(
        Arc::clone(tracker),
        config.orphan_check_interval(),
        shutdown.clone(),
    );
    loops::spawn_expiry_sweep(
        Arc::clone(tracker),
        config.expiry_check_interval(),
        shutdown.clone(),
    );

    if config.process_fallback {
        let monitor = Arc::new(ProcessMonitor::new(
            Box::new(SysinfoSource::new()),
            Arc::clone(tracker),
        ));
        loops::spawn_process_scan(monitor, config.process_scan_interval(), shutdown.clone());
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c; shutting down"),
        _ = terminate => info!("Received SIGTERM; shutting down"),
    }
}

fn init_logging() {
    let debug_enabled = env::var("PULSE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
