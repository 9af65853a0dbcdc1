//! CLI entry point for the HEVC sweep daemon
//!
//! Parses command line arguments, sets up logging and runs one sweep.

use clap::Parser;
use hevc_sweep::{AdmissionStatus, CancellationTokenSource, Config, Daemon, HostSignals, ScanningStatus};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// HEVC sweep - re-encode H.264 media libraries to HEVC in the background
#[derive(Parser, Debug)]
#[command(name = "hevc-sweep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Library directories to sweep
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Address for the JSON status endpoint
    #[arg(long, default_value = "127.0.0.1:7879")]
    status_addr: SocketAddr,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    info!(config = %args.config.display(), "HEVC sweep starting");

    let daemon_result = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map(|config| {
                let signals = Arc::new(HostSignals::new(&config.admission));
                Daemon::new_without_checks(config, signals)
            })
            .map_err(|e| e.into())
    } else {
        Daemon::load(&args.config).await
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon.with_status_addr(args.status_addr),
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationTokenSource::new();
    let token = shutdown.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            shutdown.cancel();
        }
    });

    info!(addr = %args.status_addr, "status available at /status");
    match daemon.run(&args.roots, &token).await {
        Ok(state) if state.is_done => ExitCode::SUCCESS,
        Ok(state)
            if state.scanning_status
                == (ScanningStatus::Paused {
                    reason: AdmissionStatus::HardwareIncapable,
                }) =>
        {
            error!(
                backlog = state.backlog_count,
                "{}",
                AdmissionStatus::HardwareIncapable.friendly()
            );
            ExitCode::FAILURE
        }
        Ok(state) => {
            info!(
                processed = state.processed_count,
                total = state.total_count,
                "sweep interrupted"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}
