//! In-memory pipeline with scripted behavior, shared by unit tests.

use crate::cancellation::CancellationToken;
use crate::item::{Item, TranscodeStats, VideoCodec};
use crate::pipeline::{ItemPipeline, PipelineError, ProcessProgress, ProgressFn};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Every item is H.264 and transcodes to half its size unless scripted
/// otherwise.
#[derive(Default)]
pub struct ScriptedPipeline {
    codecs: HashMap<String, VideoCodec>,
    failures: HashSet<String>,
    capability_failures: HashSet<String>,
    local: Mutex<HashSet<String>>,
    delay: Duration,
    capability_calls: AtomicUsize,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, key: &str, codec: VideoCodec) -> Self {
        self.codecs.insert(key.to_string(), codec);
        self
    }

    pub fn with_failure(mut self, key: &str) -> Self {
        self.failures.insert(key.to_string());
        self
    }

    pub fn with_capability_failure(mut self, key: &str) -> Self {
        self.capability_failures.insert(key.to_string());
        self
    }

    pub fn with_local(self, key: &str) -> Self {
        self.local.lock().insert(key.to_string());
        self
    }

    /// How long `process_item` takes between its first and last progress.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn capability_calls(&self) -> usize {
        self.capability_calls.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl ItemPipeline for ScriptedPipeline {
    async fn check_capability(
        &self,
        item: &Item,
        _token: &CancellationToken,
    ) -> Result<VideoCodec, PipelineError> {
        self.capability_calls.fetch_add(1, Ordering::SeqCst);
        if self.capability_failures.contains(&item.key) {
            return Err(PipelineError::failed("probe exited with status 1"));
        }
        Ok(self.codecs.get(&item.key).copied().unwrap_or(VideoCodec::Avc1))
    }

    async fn process_item(
        &self,
        item: &Item,
        token: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<TranscodeStats, PipelineError> {
        self.started.lock().push(item.key.clone());
        progress(ProcessProgress::Downloading(0.0));

        if !self.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if token.is_cancelling() {
            return Err(PipelineError::Cancelled);
        }

        progress(ProcessProgress::Downloading(1.0));
        progress(ProcessProgress::Encoding(1.0));
        if self.failures.contains(&item.key) {
            return Err(PipelineError::failed("encoder exited with status 1"));
        }

        self.finished.lock().push(item.key.clone());
        Ok(TranscodeStats {
            original_file_size: item.size_bytes,
            transcoded_file_size: item.size_bytes / 2,
            download_seconds: 0.0,
            encode_seconds: self.delay.as_secs_f32(),
        })
    }

    async fn is_locally_available(&self, item: &Item) -> bool {
        self.local.lock().contains(&item.key)
    }
}
