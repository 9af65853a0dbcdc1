//! Daemon startup and main run for the HEVC sweep
//!
//! Owns the long-lived services (caches, admission monitor, pipeline, status
//! report) and drives one sweep over the configured libraries.

use crate::admission::{AdmissionMonitor, AdmissionPolicy, AdmissionStatus, DeviceSignals};
use crate::caches::{Caches, PruneScope};
use crate::cancellation::{CancellationToken, CancellationTokenSource};
use crate::config::{Config, ConfigError};
use crate::item::Item;
use crate::local_pipeline::LocalPipeline;
use crate::report::{new_shared_status, SharedStatus, StatusReport};
use crate::scan::scan_libraries;
use crate::scheduler::{SchedulerDeps, SchedulerState, WorkScheduler};
use crate::signals::HostSignals;
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::{run_status_server, DEFAULT_STATUS_ADDR};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// A background task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    caches: Arc<Caches>,
    admission: Arc<AdmissionMonitor>,
    pipeline: Arc<LocalPipeline>,
    status: SharedStatus,
    status_addr: SocketAddr,
}

impl Daemon {
    /// Load the config file (with environment overrides) and initialize.
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::new(config).await
    }

    /// Initialize the daemon
    ///
    /// 1. Run startup checks (ffmpeg, ffprobe, working directories)
    /// 2. Open the caches
    /// 3. Evaluate admission against the host's signals
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        let signals = Arc::new(HostSignals::new(&config.admission));
        Ok(Self::new_without_checks(config, signals))
    }

    /// Initialize the daemon without running startup checks, against the
    /// given signal source. Must be called within a tokio runtime.
    pub fn new_without_checks(config: Config, signals: Arc<dyn DeviceSignals>) -> Self {
        let caches = Arc::new(Caches::open(&config.cache));
        let admission = Arc::new(AdmissionMonitor::new(
            signals,
            AdmissionPolicy::from(&config.admission),
        ));
        let initial = admission.start();
        if initial == AdmissionStatus::HardwareIncapable {
            warn!(admission = %initial, "this host cannot encode, runs will end without work");
        } else {
            info!(admission = %initial, "admission evaluated");
        }

        let pipeline = Arc::new(LocalPipeline::new(
            config.encode.clone(),
            caches.resource_stats.clone(),
        ));

        Self {
            config,
            caches,
            admission,
            pipeline,
            status: new_shared_status(),
            status_addr: SocketAddr::from(DEFAULT_STATUS_ADDR),
        }
    }

    /// Serve status on `addr` instead of the default.
    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = addr;
        self
    }

    /// Get the shared status report
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    pub fn admission(&self) -> &Arc<AdmissionMonitor> {
        &self.admission
    }

    /// Sweep `roots` once
    ///
    /// Scans the libraries, prunes cache entries for vanished items, then
    /// runs the scheduler until every item is processed or `token` is
    /// cancelled. The signal poller and status server live for the length
    /// of the run. Caches are flushed before returning.
    pub async fn run(&self, roots: &[PathBuf], token: &CancellationToken) -> Result<SchedulerState, DaemonError> {
        let scan_roots = roots.to_vec();
        let items = tokio::task::spawn_blocking(move || scan_libraries(&scan_roots)).await?;
        info!(items = items.len(), roots = roots.len(), "library scanned");

        let pruned = self.caches.prune(&self.prune_scope(&items).await).await;
        info!(?pruned, "caches pruned");

        let services = CancellationTokenSource::linked(token);
        let poller = tokio::spawn(self.admission.clone().poll(
            Duration::from_millis(self.config.admission.poll_interval_ms),
            services.token(),
        ));
        let server = {
            let status = self.status.clone();
            let addr = self.status_addr;
            let token = services.token();
            tokio::spawn(async move {
                if let Err(e) = run_status_server(status, addr, token).await {
                    error!(error = %e, "status server error");
                }
            })
        };

        let deps = SchedulerDeps {
            pipeline: self.pipeline.clone(),
            caches: self.caches.clone(),
            admission: self.admission.clone(),
            config: self.config.scheduler.clone(),
            min_savings_ratio: self.config.encode.min_savings_ratio,
        };
        let sink = {
            let status = self.status.clone();
            let admission = self.admission.clone();
            move |state: SchedulerState| {
                *status.write() = StatusReport::from_state(&state, admission.status());
            }
        };

        let scheduler = WorkScheduler::start(items, deps, sink, token);
        let state = scheduler.join().await;

        services.cancel();
        self.caches.flush().await;
        poller.await?;
        server.await?;

        info!(
            total = state.total_count,
            completed = state.completed.len(),
            failed = state.failed_count,
            ready_savings_bytes = state.ready_savings_bytes,
            done = state.is_done,
            "sweep finished"
        );
        Ok(state)
    }

    async fn prune_scope(&self, items: &[Item]) -> PruneScope {
        let all_keys: HashSet<String> = items.iter().map(|item| item.key.clone()).collect();
        let mut keys_with_output = HashSet::new();
        for item in items {
            if tokio::fs::try_exists(self.pipeline.output_path_for(item))
                .await
                .unwrap_or(false)
            {
                keys_with_output.insert(item.key.clone());
            }
        }

        PruneScope {
            // The scanner only yields videos.
            video_keys: all_keys.clone(),
            all_keys,
            keys_with_output,
            min_savings_ratio: self.config.encode.min_savings_ratio,
        }
    }
}
