//! Status report module
//!
//! Folds scheduler snapshots into a JSON-friendly report shared with the
//! status server.

use crate::admission::AdmissionStatus;
use crate::scheduler::{ScanningStatus, SchedulerState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One operation currently in flight
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InFlightReport {
    pub key: String,
    pub stage: String,
    pub fraction: Option<f64>,
}

/// Externally visible state of the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub timestamp_unix_ms: i64,
    pub admission: AdmissionStatus,
    pub scanning_status: ScanningStatus,
    /// Human-readable form of `scanning_status`
    pub status_text: String,
    pub total_count: usize,
    pub processed_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub backlog_count: usize,
    pub ready_savings_bytes: u64,
    pub in_flight: Vec<InFlightReport>,
}

/// Shared report state, written by the scheduler sink and read by the server
pub type SharedStatus = Arc<RwLock<StatusReport>>;

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            admission: AdmissionStatus::Allowed,
            scanning_status: ScanningStatus::Starting,
            status_text: ScanningStatus::Starting.to_string(),
            total_count: 0,
            processed_count: 0,
            completed_count: 0,
            failed_count: 0,
            backlog_count: 0,
            ready_savings_bytes: 0,
            in_flight: Vec::new(),
        }
    }
}

impl StatusReport {
    pub fn from_state(state: &SchedulerState, admission: AdmissionStatus) -> Self {
        let mut in_flight: Vec<InFlightReport> = state
            .in_flight
            .iter()
            .map(|(key, progress)| InFlightReport {
                key: key.clone(),
                stage: progress.stage().to_string(),
                fraction: progress.fraction(),
            })
            .collect();
        in_flight.sort_by(|a, b| a.key.cmp(&b.key));

        Self {
            timestamp_unix_ms: now_unix_ms(),
            admission,
            scanning_status: state.scanning_status,
            status_text: state.scanning_status.to_string(),
            total_count: state.total_count,
            processed_count: state.processed_count,
            completed_count: state.completed.len(),
            failed_count: state.failed_count,
            backlog_count: state.backlog_count,
            ready_savings_bytes: state.ready_savings_bytes,
            in_flight,
        }
    }
}

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusReport::default()))
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
