//! Drives [`ItemOperation`]s over a whole collection.
//!
//! All bookkeeping (backlog, in-flight map, counters) lives in a single actor
//! task fed by a command channel. Operation events, admission changes,
//! priority boosts and cancellation all arrive as commands, so they are
//! applied one at a time regardless of which thread produced them.
//!
//! The backlog is a stack: the next item is popped from the end, and a
//! boosted item is moved to the end.

use crate::admission::{AdmissionMonitor, AdmissionStatus};
use crate::caches::Caches;
use crate::cancellation::{CancellationToken, CancellationTokenSource};
use crate::item::{Item, TranscodeStats};
use crate::operation::{ItemOperation, OperationEvent, OperationOutcome, OperationProgress, OperationReporter};
use crate::pipeline::ItemPipeline;
use crate::throttle::Throttler;
use hevc_sweep_config::SchedulerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Coarse progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanningStatus {
    Starting,
    Scanning { done: usize, total: usize },
    Paused { reason: AdmissionStatus },
    Done { total: usize },
}

impl Default for ScanningStatus {
    fn default() -> Self {
        ScanningStatus::Starting
    }
}

impl std::fmt::Display for ScanningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanningStatus::Starting => write!(f, "starting"),
            ScanningStatus::Scanning { done, total } => write!(f, "scanning {}/{}", done, total),
            ScanningStatus::Paused { reason } => write!(f, "{}", reason),
            ScanningStatus::Done { total } => write!(f, "done ({} items)", total),
        }
    }
}

/// Snapshot handed to the state sink.
///
/// Every item is in exactly one of: `completed`, failed (counted only),
/// the backlog (counted only) or `in_flight`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerState {
    /// Nothing left in the backlog or in flight.
    pub is_done: bool,
    /// `completed.len() + failed_count`
    pub processed_count: usize,
    pub total_count: usize,
    pub failed_count: usize,
    pub backlog_count: usize,
    pub completed: HashSet<Item>,
    pub in_flight: HashMap<String, OperationProgress>,
    pub scanning_status: ScanningStatus,
    /// Sum of applicable savings over completed transcodes.
    pub ready_savings_bytes: u64,
}

/// Services a scheduler runs against.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub pipeline: Arc<dyn ItemPipeline>,
    pub caches: Arc<Caches>,
    pub admission: Arc<AdmissionMonitor>,
    pub config: SchedulerConfig,
    pub min_savings_ratio: f32,
}

type StateSink = Arc<dyn Fn(SchedulerState) + Send + Sync>;

enum Command {
    Event {
        key: String,
        attempt: u64,
        event: OperationEvent,
    },
    WorkerExited,
    AdmissionChanged,
    Boost(String),
    Emit,
    CancelAll,
}

/// Cancels a scheduler from any thread, including from inside a
/// cancellation callback.
#[derive(Clone)]
struct Canceller {
    source: Arc<CancellationTokenSource>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Canceller {
    fn cancel_all(&self) {
        self.source.cancel();
        let _ = self.commands.send(Command::CancelAll);
    }
}

/// Handle to a running scheduler.
pub struct WorkScheduler {
    canceller: Canceller,
    last_state: Arc<Mutex<SchedulerState>>,
    actor: JoinHandle<SchedulerState>,
    total_count: usize,
}

impl WorkScheduler {
    /// Start processing `items`, given in priority order. Items repeating an
    /// earlier key are dropped.
    ///
    /// `sink` receives throttled snapshots from the actor task, plus one
    /// unthrottled terminal snapshot. Cancelling `external` is equivalent to
    /// [`cancel_all`](Self::cancel_all). Must be called within a tokio
    /// runtime.
    pub fn start<F>(items: Vec<Item>, deps: SchedulerDeps, sink: F, external: &CancellationToken) -> Self
    where
        F: Fn(SchedulerState) + Send + Sync + 'static,
    {
        let mut seen = HashSet::new();
        let items: Vec<Item> = items
            .into_iter()
            .filter(|item| seen.insert(item.key.clone()))
            .collect();
        let total_count = items.len();

        let (commands, rx) = mpsc::unbounded_channel();
        let source = Arc::new(CancellationTokenSource::new());
        let canceller = Canceller {
            source: source.clone(),
            commands: commands.clone(),
        };
        let last_state = Arc::new(Mutex::new(SchedulerState {
            total_count,
            ..SchedulerState::default()
        }));

        // Subscribe before the actor reads the first status so no change is
        // missed in between.
        spawn_admission_listener(&deps.admission, commands.clone(), source.token());

        let emit_tx = commands.clone();
        let emitter = Throttler::new(Duration::from_millis(deps.config.progress_interval_ms), move || {
            let emit_tx = emit_tx.clone();
            async move {
                let _ = emit_tx.send(Command::Emit);
            }
        });

        let actor = Actor {
            permits: Arc::new(Semaphore::new(deps.config.effective_max_concurrent_operations())),
            deps,
            token: source.token(),
            source,
            commands,
            emitter,
            sink: Arc::new(sink),
            last_state: last_state.clone(),
            total_count,
            backlog: Vec::new(),
            in_flight: HashMap::new(),
            completed: HashSet::new(),
            failed_count: 0,
            ready_savings_bytes: 0,
            dispatched_any: false,
            status: AdmissionStatus::Allowed,
            suspended: false,
            next_attempt: 0,
            pending_writes: Vec::new(),
        };
        let actor = tokio::spawn(actor.run(items, rx));

        {
            let canceller = canceller.clone();
            external.register(move || canceller.cancel_all());
        }

        Self {
            canceller,
            last_state,
            actor,
            total_count,
        }
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// Move the backlog item with this key to the top. Items already in
    /// flight or finished are left alone.
    pub fn boost_priority(&self, key: &str) {
        let _ = self.canceller.commands.send(Command::Boost(key.to_string()));
    }

    /// Cancel every operation and stop. The final snapshot is emitted
    /// immediately. Safe to call from any thread, any number of times.
    pub fn cancel_all(&self) {
        self.canceller.cancel_all();
    }

    /// The most recently emitted snapshot.
    pub fn snapshot(&self) -> SchedulerState {
        self.last_state.lock().clone()
    }

    /// Wait for the run to end (done or cancelled) and return its final
    /// state.
    pub async fn join(self) -> SchedulerState {
        match self.actor.await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "scheduler task failed");
                self.last_state.lock().clone()
            }
        }
    }
}

impl std::fmt::Debug for WorkScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkScheduler")
            .field("total_count", &self.total_count)
            .field("cancelled", &self.canceller.source.is_cancelling())
            .finish()
    }
}

fn spawn_admission_listener(
    admission: &AdmissionMonitor,
    commands: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
) {
    let mut changes = admission.subscribe();
    tokio::spawn(async move {
        let cancelled = token.cancelled();
        tokio::pin!(cancelled);
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                received = changes.recv() => match received {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        if commands.send(Command::AdmissionChanged).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

struct InFlight {
    item: Item,
    attempt: u64,
    progress: OperationProgress,
    canceller: Arc<CancellationTokenSource>,
}

struct Actor {
    deps: SchedulerDeps,
    source: Arc<CancellationTokenSource>,
    token: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    emitter: Throttler,
    sink: StateSink,
    last_state: Arc<Mutex<SchedulerState>>,

    total_count: usize,
    /// Top of the stack is the end.
    backlog: Vec<Item>,
    in_flight: HashMap<String, InFlight>,
    completed: HashSet<Item>,
    failed_count: usize,
    ready_savings_bytes: u64,
    dispatched_any: bool,
    status: AdmissionStatus,
    suspended: bool,
    next_attempt: u64,
    pending_writes: Vec<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self, items: Vec<Item>, rx: mpsc::UnboundedReceiver<Command>) -> SchedulerState {
        let state = self.drive(items, rx).await;
        // Outcomes recorded near the end must reach the cache before the
        // caller flushes it.
        for write in self.pending_writes.drain(..) {
            if let Err(e) = write.await {
                warn!(error = %e, "outcome write failed");
            }
        }
        state
    }

    async fn drive(&mut self, items: Vec<Item>, mut rx: mpsc::UnboundedReceiver<Command>) -> SchedulerState {
        self.partition(items).await;
        info!(
            total = self.total_count,
            resolved = self.completed.len(),
            backlog = self.backlog.len(),
            "scheduler started"
        );

        self.status = self.deps.admission.status();
        self.suspended = !self.status.is_allowed();
        if self.status == AdmissionStatus::HardwareIncapable {
            return self.stop_incapable();
        }
        self.spawn_local_availability_pass();
        self.fill();

        if self.is_done() {
            return self.finish();
        }
        self.emitter.trigger();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Event { key, attempt, event } => self.on_event(key, attempt, event),
                Command::WorkerExited => self.fill(),
                Command::AdmissionChanged => {
                    self.on_admission_changed();
                    if self.status == AdmissionStatus::HardwareIncapable {
                        return self.stop_incapable();
                    }
                }
                Command::Boost(key) => self.boost(&key),
                Command::Emit => {
                    self.emit();
                    continue;
                }
                Command::CancelAll => {
                    info!("scheduler cancelled");
                    for entry in self.in_flight.values() {
                        entry.canceller.cancel();
                    }
                    return self.emit();
                }
            }

            if self.is_done() {
                return self.finish();
            }
            self.emitter.trigger();
        }

        self.emit()
    }

    /// Seed `completed` with items whose result is already known and stack
    /// the rest, highest priority on top.
    async fn partition(&mut self, items: Vec<Item>) {
        let caches = self.deps.caches.clone();
        let mut needs_work = Vec::new();

        for item in items {
            if let Some(stats) = caches.outcome.get(&item.key).await {
                self.record_savings(&stats);
                self.completed.insert(item);
                continue;
            }
            if let Some(codec) = caches.capability.get(&item.key).await {
                if !codec.should_attempt_transcode() {
                    self.completed.insert(item);
                    continue;
                }
            }
            needs_work.push(item);
        }

        needs_work.reverse();
        self.backlog = needs_work;
    }

    /// Boost every backlog item that is locally available right now. Runs
    /// bottom of the stack first, so the highest priority hit ends on top.
    fn spawn_local_availability_pass(&self) {
        if self.backlog.is_empty() {
            return;
        }
        let candidates = self.backlog.clone();
        let pipeline = self.deps.pipeline.clone();
        let commands = self.commands.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            for item in candidates {
                if token.is_cancelling() {
                    return;
                }
                if pipeline.is_locally_available(&item).await {
                    debug!(key = %item.key, "locally available, boosting");
                    if commands.send(Command::Boost(item.key)).is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn is_done(&self) -> bool {
        self.backlog.is_empty() && self.in_flight.is_empty()
    }

    fn fill(&mut self) {
        if self.suspended || self.token.is_cancelling() {
            return;
        }
        while !self.backlog.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            if let Some(item) = self.backlog.pop() {
                self.dispatch(item, permit);
            }
        }
    }

    fn dispatch(&mut self, item: Item, permit: OwnedSemaphorePermit) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.dispatched_any = true;

        let operation = ItemOperation::new(
            item.clone(),
            attempt,
            self.deps.pipeline.clone(),
            self.deps.caches.capability.clone(),
            &self.token,
        );
        let canceller = operation.canceller();

        let events = self.commands.clone();
        let key = item.key.clone();
        let reporter = OperationReporter::new(move |event| {
            let _ = events.send(Command::Event {
                key: key.clone(),
                attempt,
                event,
            });
        });

        debug!(key = %item.key, attempt, "dispatching");
        self.in_flight.insert(
            item.key.clone(),
            InFlight {
                item,
                attempt,
                progress: OperationProgress::CheckingCapability,
                canceller,
            },
        );

        let exited = self.commands.clone();
        tokio::spawn(async move {
            operation.run(reporter).await;
            drop(permit);
            let _ = exited.send(Command::WorkerExited);
        });
    }

    fn on_event(&mut self, key: String, attempt: u64, event: OperationEvent) {
        if self.in_flight.get(&key).map(|entry| entry.attempt) != Some(attempt) {
            debug!(key = %key, attempt, "ignoring event from stale attempt");
            return;
        }
        match event {
            OperationEvent::Progress(progress) => {
                if let Some(entry) = self.in_flight.get_mut(&key) {
                    entry.progress = progress;
                }
            }
            OperationEvent::Finished(outcome) => {
                if let Some(entry) = self.in_flight.remove(&key) {
                    self.on_outcome(entry.item, outcome);
                }
            }
        }
    }

    fn on_outcome(&mut self, item: Item, outcome: OperationOutcome) {
        match outcome {
            OperationOutcome::Succeeded(stats) => {
                info!(
                    key = %item.key,
                    savings_bytes = stats.raw_savings_bytes(),
                    encode_seconds = stats.encode_seconds,
                    "transcoded"
                );
                self.record_savings(&stats);
                let caches = self.deps.caches.clone();
                let key = item.key.clone();
                self.pending_writes.retain(|write| !write.is_finished());
                self.pending_writes
                    .push(tokio::spawn(async move { caches.outcome.put(key, stats).await }));
                self.completed.insert(item);
            }
            OperationOutcome::Skipped(codec) => {
                debug!(key = %item.key, codec = %codec, "skipped");
                self.completed.insert(item);
            }
            OperationOutcome::Failed(reason) => {
                warn!(key = %item.key, reason = %reason, "item failed, dropped for this run");
                self.failed_count += 1;
            }
            OperationOutcome::Cancelled => {
                debug!(key = %item.key, "cancelled, re-enqueued");
                self.backlog.push(item);
            }
        }
        self.fill();
    }

    fn on_admission_changed(&mut self) {
        self.status = self.deps.admission.status();
        let suspended = !self.status.is_allowed();
        if suspended == self.suspended {
            return;
        }
        self.suspended = suspended;

        if suspended {
            info!(reason = %self.status, in_flight = self.in_flight.len(), "suspending");
            for entry in self.in_flight.values() {
                entry.canceller.cancel();
            }
        } else {
            info!("resuming");
            self.fill();
        }
    }

    fn boost(&mut self, key: &str) {
        match self.backlog.iter().rposition(|item| item.key == key) {
            Some(index) => {
                let item = self.backlog.remove(index);
                self.backlog.push(item);
                debug!(key, "boosted");
            }
            None => debug!(key, "boost ignored, not in backlog"),
        }
    }

    fn record_savings(&mut self, stats: &TranscodeStats) {
        if let Some(bytes) = stats.applicable_savings_bytes(self.deps.min_savings_ratio) {
            self.ready_savings_bytes += bytes;
        }
    }

    fn snapshot(&self) -> SchedulerState {
        let processed_count = self.completed.len() + self.failed_count;
        let scanning_status = if self.is_done() {
            ScanningStatus::Done {
                total: self.total_count,
            }
        } else if self.suspended {
            ScanningStatus::Paused { reason: self.status }
        } else if !self.dispatched_any {
            ScanningStatus::Starting
        } else {
            ScanningStatus::Scanning {
                done: processed_count,
                total: self.total_count,
            }
        };

        SchedulerState {
            is_done: self.is_done(),
            processed_count,
            total_count: self.total_count,
            failed_count: self.failed_count,
            backlog_count: self.backlog.len(),
            completed: self.completed.clone(),
            in_flight: self
                .in_flight
                .iter()
                .map(|(key, entry)| (key.clone(), entry.progress))
                .collect(),
            scanning_status,
            ready_savings_bytes: self.ready_savings_bytes,
        }
    }

    fn emit(&self) -> SchedulerState {
        let state = self.snapshot();
        *self.last_state.lock() = state.clone();
        (self.sink)(state.clone());
        state
    }

    /// Capability never changes once evaluated, so a host that cannot
    /// encode ends the run with its backlog intact.
    fn stop_incapable(&self) -> SchedulerState {
        warn!(backlog = self.backlog.len(), "host cannot encode, ending run");
        for entry in self.in_flight.values() {
            entry.canceller.cancel();
        }
        self.finish()
    }

    /// Terminal emission for a completed run. Tears down the scheduler's
    /// token so background helpers stop.
    fn finish(&self) -> SchedulerState {
        let state = self.emit();
        info!(
            total = state.total_count,
            completed = state.completed.len(),
            failed = state.failed_count,
            savings_bytes = state.ready_savings_bytes,
            "scheduler done"
        );
        self.source.cancel();
        state
    }
}
