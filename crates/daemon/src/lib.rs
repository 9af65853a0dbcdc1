//! HEVC sweep daemon
//!
//! Background service that walks media libraries and re-encodes H.264 videos
//! to HEVC while the device is idle: a bounded worker pool gated by device
//! conditions, with persistent memoization of per-item results.

pub mod admission;
pub mod cache;
pub mod caches;
pub mod cancellation;
pub mod daemon;
pub mod encode;
pub mod item;
pub mod local_pipeline;
pub mod operation;
pub mod pipeline;
pub mod probe;
pub mod report;
pub mod scan;
pub mod scheduler;
pub mod signals;
pub mod startup;
pub mod status_server;
pub mod throttle;

#[cfg(test)]
mod test_support;

pub use hevc_sweep_config as config;
pub use hevc_sweep_config::Config;

pub use admission::{
    AdmissionMonitor, AdmissionPolicy, AdmissionStatus, DeviceSignals, ManualSignals, NetworkClass,
    PowerState,
};
pub use cache::MemoizingCache;
pub use caches::{Caches, PruneReport, PruneScope};
pub use cancellation::{CancellationToken, CancellationTokenSource};
pub use daemon::{Daemon, DaemonError};
pub use item::{Item, ResourceStats, TranscodeStats, VideoCodec};
pub use local_pipeline::LocalPipeline;
pub use operation::{ItemOperation, OperationEvent, OperationOutcome, OperationProgress, OperationReporter};
pub use pipeline::{ItemPipeline, PipelineError, ProcessProgress};
pub use report::{new_shared_status, SharedStatus, StatusReport};
pub use scan::scan_libraries;
pub use scheduler::{ScanningStatus, SchedulerDeps, SchedulerState, WorkScheduler};
pub use signals::HostSignals;
pub use startup::{run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use throttle::Throttler;
