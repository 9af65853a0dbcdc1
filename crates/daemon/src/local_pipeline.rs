//! [`ItemPipeline`] over the local filesystem.
//!
//! Capability is the probed codec of the source. Processing stages a copy of
//! the source (the "download"), encodes it to HEVC into the output directory
//! and reports the size difference. An output that is not worth applying is
//! deleted again; its stats are still returned so the item is not retried.

use crate::cache::MemoizingCache;
use crate::cancellation::CancellationToken;
use crate::encode::{run_ffmpeg, EncodeError, HevcEncodeParams};
use crate::item::{Item, ResourceStats, TranscodeStats, VideoCodec};
use crate::pipeline::{ItemPipeline, PipelineError, ProcessProgress, ProgressFn};
use crate::probe::{probe_file, ProbeError};
use async_trait::async_trait;
use hevc_sweep_config::EncodeConfig;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const COPY_CHUNK_BYTES: usize = 1 << 20;

impl From<ProbeError> for PipelineError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Cancelled => PipelineError::Cancelled,
            ProbeError::Io(e) => PipelineError::Io(e),
            other => PipelineError::failed(other.to_string()),
        }
    }
}

impl From<EncodeError> for PipelineError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Cancelled => PipelineError::Cancelled,
            EncodeError::Io(e) => PipelineError::Io(e),
            other => PipelineError::failed(other.to_string()),
        }
    }
}

/// Flatten an item key into a single file name: path separators and
/// characters unsafe in file names become `_`.
pub fn sanitized_file_name(key: &str) -> String {
    let name: String = key
        .trim_start_matches(['/', '\\'])
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | '|' | '"' | '<' | '>' | ':' => '_',
            c => c,
        })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

/// Copy `source` to `dest` in chunks, reporting the copied fraction.
///
/// Data lands in `<dest>.part` and is renamed into place once complete, so
/// `dest` exists only as a full copy. Cancellation removes the partial file.
pub async fn staged_copy(
    source: &Path,
    dest: &Path,
    token: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> Result<u64, PipelineError> {
    let partial = dest.with_extension(match dest.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    });

    let result = copy_chunks(source, &partial, token, on_progress).await;
    match result {
        Ok(copied) => {
            tokio::fs::rename(&partial, dest).await?;
            Ok(copied)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

async fn copy_chunks(
    source: &Path,
    dest: &Path,
    token: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> Result<u64, PipelineError> {
    let mut reader = tokio::fs::File::open(source).await?;
    let total = reader.metadata().await?.len();
    let mut writer = tokio::fs::File::create(dest).await?;

    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut copied = 0u64;
    on_progress(0.0);
    loop {
        if token.is_cancelling() {
            return Err(PipelineError::Cancelled);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
        if total > 0 {
            on_progress((copied as f64 / total as f64).min(1.0));
        }
    }
    writer.flush().await?;
    on_progress(1.0);
    Ok(copied)
}

/// Transcodes items found on local disk with ffmpeg.
pub struct LocalPipeline {
    config: EncodeConfig,
    resource_stats: MemoizingCache<String, ResourceStats>,
}

impl LocalPipeline {
    pub fn new(config: EncodeConfig, resource_stats: MemoizingCache<String, ResourceStats>) -> Self {
        Self {
            config,
            resource_stats,
        }
    }

    /// Where the transcoded output of `item` is written.
    pub fn output_path_for(&self, item: &Item) -> PathBuf {
        self.config.output_dir.join(sanitized_file_name(&item.key))
    }

    /// Where the staged copy of `item` is kept while it is processed.
    pub fn staged_path_for(&self, item: &Item) -> PathBuf {
        self.config.staging_dir.join(sanitized_file_name(&item.key))
    }

    async fn duration_of(&self, item: &Item, token: &CancellationToken) -> Result<f64, PipelineError> {
        if let Some(stats) = self.resource_stats.get(&item.key).await {
            return Ok(stats.duration_secs);
        }
        let probed = probe_file(&item.source, token).await?;
        self.resource_stats
            .put(item.key.clone(), probed.resource_stats(&item.source))
            .await;
        Ok(probed.duration_secs)
    }
}

#[async_trait]
impl ItemPipeline for LocalPipeline {
    async fn check_capability(
        &self,
        item: &Item,
        token: &CancellationToken,
    ) -> Result<VideoCodec, PipelineError> {
        let probed = probe_file(&item.source, token).await?;
        self.resource_stats
            .put(item.key.clone(), probed.resource_stats(&item.source))
            .await;
        let codec = probed.video_codec();
        debug!(key = %item.key, codec = %codec, "probed");
        Ok(codec)
    }

    async fn process_item(
        &self,
        item: &Item,
        token: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<TranscodeStats, PipelineError> {
        progress(ProcessProgress::WaitingToDownload);
        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let staged = self.staged_path_for(item);
        let download_started = Instant::now();
        if !self.is_locally_available(item).await {
            staged_copy(&item.source, &staged, token, &|f| {
                progress(ProcessProgress::Downloading(f))
            })
            .await?;
        } else {
            progress(ProcessProgress::Downloading(1.0));
        }
        let download_seconds = download_started.elapsed().as_secs_f32();

        let result = self.encode_staged(item, &staged, token, progress).await;
        // A cancelled attempt keeps its staged copy so the retry starts local.
        if matches!(result, Err(PipelineError::Cancelled)) {
            debug!(key = %item.key, "keeping staged copy after cancel");
        } else if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!(path = %staged.display(), error = %e, "could not remove staged copy");
        }
        let (original_file_size, transcoded_file_size, encode_seconds) = result?;

        let stats = TranscodeStats {
            original_file_size,
            transcoded_file_size,
            download_seconds,
            encode_seconds,
        };

        let output = self.output_path_for(item);
        if stats.should_apply(self.config.min_savings_ratio) {
            info!(
                key = %item.key,
                saved_bytes = stats.raw_savings_bytes(),
                output = %output.display(),
                "transcode ready"
            );
        } else {
            info!(key = %item.key, ratio = stats.raw_savings_ratio(), "savings too small, discarding output");
            if let Err(e) = tokio::fs::remove_file(&output).await {
                warn!(path = %output.display(), error = %e, "could not remove discarded output");
            }
        }
        Ok(stats)
    }

    async fn is_locally_available(&self, item: &Item) -> bool {
        tokio::fs::metadata(self.staged_path_for(item))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }
}

impl LocalPipeline {
    /// Encode the staged copy, returning original size, output size and
    /// encode time.
    async fn encode_staged(
        &self,
        item: &Item,
        staged: &Path,
        token: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<(u64, u64, f32), PipelineError> {
        let original_file_size = tokio::fs::metadata(staged).await?.len();
        let duration_secs = self.duration_of(item, token).await?;

        let params = HevcEncodeParams {
            input_path: staged.to_path_buf(),
            output_path: self.output_path_for(item),
            crf: self.config.crf,
            preset: self.config.preset.clone(),
            duration_secs,
        };

        let encode_started = Instant::now();
        progress(ProcessProgress::Encoding(0.0));
        if let Err(e) = run_ffmpeg(&params, token, &|f| progress(ProcessProgress::Encoding(f))).await {
            let _ = tokio::fs::remove_file(&params.output_path).await;
            return Err(e.into());
        }
        progress(ProcessProgress::Encoding(1.0));
        let encode_seconds = encode_started.elapsed().as_secs_f32();

        let transcoded_file_size = tokio::fs::metadata(&params.output_path).await?.len();
        Ok((original_file_size, transcoded_file_size, encode_seconds))
    }
}
