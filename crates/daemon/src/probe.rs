//! Inspecting media with ffprobe.
//!
//! Runs `ffprobe -v quiet -print_format json -show_streams -show_format` and
//! reduces the output to what the sweep needs: the codec of the first video
//! stream plus size and duration.

use crate::cancellation::CancellationToken;
use crate::item::{ResourceStats, VideoCodec};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported a failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The probe was cancelled before it finished.
    #[error("Probe cancelled")]
    Cancelled,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of probing a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Raw `codec_name` of the first video stream, if there is one.
    pub video_codec_name: Option<String>,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

impl ProbeResult {
    /// Codec of the first video stream; files without video map to
    /// [`VideoCodec::Unknown`].
    pub fn video_codec(&self) -> VideoCodec {
        self.video_codec_name
            .as_deref()
            .map(VideoCodec::from_codec_name)
            .unwrap_or(VideoCodec::Unknown)
    }

    pub fn resource_stats(&self, path: &Path) -> ResourceStats {
        ResourceStats {
            size_bytes: self.size_bytes,
            duration_secs: self.duration_secs,
            original_file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        }
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Probe `path`, killing ffprobe if `token` is cancelled first.
pub async fn probe_file(path: &Path, token: &CancellationToken) -> Result<ProbeResult, ProbeError> {
    if token.is_cancelling() {
        return Err(ProbeError::Cancelled);
    }

    let child = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::select! {
        _ = token.cancelled() => return Err(ProbeError::Cancelled),
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video_codec_name = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| s.codec_name);

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        video_codec_name,
        duration_secs,
        size_bytes,
    })
}
