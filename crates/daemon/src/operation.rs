//! A single attempt at one item.
//!
//! ```text
//! checking-capability -> done(skipped)
//! checking-capability -> waiting-to-start -> downloading -> encoding -> done(succeeded | failed)
//! any state -> cancelled
//! ```
//!
//! The operation consults its token before and after every awaited step.
//! Exactly one terminal outcome is reported per operation, and no progress
//! is reported after it.

use crate::cache::MemoizingCache;
use crate::cancellation::{CancellationToken, CancellationTokenSource};
use crate::item::{Item, TranscodeStats, VideoCodec};
use crate::pipeline::{ItemPipeline, PipelineError, ProcessProgress};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "stage", content = "fraction", rename_all = "snake_case")]
pub enum OperationProgress {
    CheckingCapability,
    WaitingToStart,
    Downloading(f64),
    Encoding(f64),
}

impl OperationProgress {
    pub fn stage(&self) -> &'static str {
        match self {
            OperationProgress::CheckingCapability => "checking",
            OperationProgress::WaitingToStart => "waiting",
            OperationProgress::Downloading(_) => "downloading",
            OperationProgress::Encoding(_) => "encoding",
        }
    }

    pub fn fraction(&self) -> Option<f64> {
        match self {
            OperationProgress::Downloading(f) | OperationProgress::Encoding(f) => Some(f.clamp(0.0, 1.0)),
            _ => None,
        }
    }
}

impl From<ProcessProgress> for OperationProgress {
    fn from(progress: ProcessProgress) -> Self {
        match progress {
            ProcessProgress::WaitingToDownload => OperationProgress::WaitingToStart,
            ProcessProgress::Downloading(f) => OperationProgress::Downloading(f),
            ProcessProgress::Encoding(f) => OperationProgress::Encoding(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The item's codec is not worth transcoding.
    Skipped(VideoCodec),
    Succeeded(TranscodeStats),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Progress(OperationProgress),
    Finished(OperationOutcome),
}

type EventSink = Box<dyn Fn(OperationEvent) + Send + Sync>;

/// Report-once channel from an operation to its owner.
///
/// Progress is forwarded until the first terminal report; everything after
/// that is dropped. The lock is held while forwarding, so progress can never
/// overtake the terminal event.
#[derive(Clone)]
pub struct OperationReporter {
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl OperationReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(OperationEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Some(Box::new(sink)))),
        }
    }

    pub fn progress(&self, progress: OperationProgress) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink(OperationEvent::Progress(progress));
        }
    }

    /// Report the terminal outcome. Returns false if one was already
    /// reported.
    pub fn finish(&self, outcome: OperationOutcome) -> bool {
        let mut guard = self.sink.lock();
        match guard.take() {
            Some(sink) => {
                sink(OperationEvent::Finished(outcome));
                true
            }
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.sink.lock().is_none()
    }
}

impl std::fmt::Debug for OperationReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationReporter")
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub struct ItemOperation {
    item: Item,
    attempt: u64,
    pipeline: Arc<dyn ItemPipeline>,
    capability: MemoizingCache<String, VideoCodec>,
    source: Arc<CancellationTokenSource>,
}

impl ItemOperation {
    /// The operation gets its own token source, cancelled along with
    /// `parent`.
    pub fn new(
        item: Item,
        attempt: u64,
        pipeline: Arc<dyn ItemPipeline>,
        capability: MemoizingCache<String, VideoCodec>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            item,
            attempt,
            pipeline,
            capability,
            source: Arc::new(CancellationTokenSource::linked(parent)),
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Handle for cancelling just this operation.
    pub fn canceller(&self) -> Arc<CancellationTokenSource> {
        self.source.clone()
    }

    pub async fn run(self, reporter: OperationReporter) {
        let token = self.source.token();
        {
            let reporter = reporter.clone();
            token.register(move || {
                reporter.finish(OperationOutcome::Cancelled);
            });
        }

        let outcome = self.execute(&token, &reporter).await;
        debug!(key = %self.item.key, attempt = self.attempt, outcome = ?outcome, "operation ended");
        reporter.finish(outcome);
    }

    async fn execute(&self, token: &CancellationToken, reporter: &OperationReporter) -> OperationOutcome {
        if token.is_cancelling() {
            return OperationOutcome::Cancelled;
        }
        reporter.progress(OperationProgress::CheckingCapability);

        let checked = self
            .capability
            .get_or_try_compute(&self.item.key, || async {
                if token.is_cancelling() {
                    return Err(PipelineError::Cancelled);
                }
                self.pipeline.check_capability(&self.item, token).await.map(Some)
            })
            .await;
        let codec = match checked {
            Ok(codec) => codec.unwrap_or(VideoCodec::Unknown),
            Err(e) => return self.outcome_for_error(e),
        };
        if token.is_cancelling() {
            return OperationOutcome::Cancelled;
        }
        if !codec.should_attempt_transcode() {
            return OperationOutcome::Skipped(codec);
        }

        reporter.progress(OperationProgress::WaitingToStart);
        let forward = |progress: ProcessProgress| reporter.progress(progress.into());
        let processed = self.pipeline.process_item(&self.item, token, &forward).await;
        if token.is_cancelling() {
            return OperationOutcome::Cancelled;
        }

        match processed {
            Ok(stats) => OperationOutcome::Succeeded(stats),
            Err(e) => self.outcome_for_error(e),
        }
    }

    fn outcome_for_error(&self, error: PipelineError) -> OperationOutcome {
        match error {
            PipelineError::Cancelled => OperationOutcome::Cancelled,
            e => {
                warn!(key = %self.item.key, attempt = self.attempt, error = %e, "operation failed");
                OperationOutcome::Failed(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ItemOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemOperation")
            .field("key", &self.item.key)
            .field("attempt", &self.attempt)
            .finish()
    }
}
