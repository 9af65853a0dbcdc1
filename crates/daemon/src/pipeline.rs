//! The per-item work the scheduler drives.
//!
//! Implementations do the expensive parts: inspecting an item's codec and
//! producing the transcoded output. Both calls must honor the token they are
//! given and must return exactly once.

use crate::cancellation::CancellationToken;
use crate::item::{Item, TranscodeStats, VideoCodec};
use async_trait::async_trait;
use thiserror::Error;

/// Error type for pipeline calls
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The call observed its token and stopped
    #[error("Cancelled")]
    Cancelled,

    /// The external step reported a failure
    #[error("Pipeline step failed: {0}")]
    Failed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn failed(message: impl Into<String>) -> Self {
        PipelineError::Failed(message.into())
    }
}

/// Progress reported by [`ItemPipeline::process_item`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessProgress {
    WaitingToDownload,
    /// Fraction in `0.0..=1.0`
    Downloading(f64),
    /// Fraction in `0.0..=1.0`
    Encoding(f64),
}

pub type ProgressFn<'a> = &'a (dyn Fn(ProcessProgress) + Send + Sync);

#[async_trait]
pub trait ItemPipeline: Send + Sync {
    /// Determine the codec of `item`'s video stream.
    async fn check_capability(
        &self,
        item: &Item,
        token: &CancellationToken,
    ) -> Result<VideoCodec, PipelineError>;

    /// Fetch and transcode `item`, reporting progress along the way.
    async fn process_item(
        &self,
        item: &Item,
        token: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<TranscodeStats, PipelineError>;

    /// Whether `item`'s full data happens to be available locally right
    /// now, making it cheap to process next.
    async fn is_locally_available(&self, _item: &Item) -> bool {
        false
    }
}
