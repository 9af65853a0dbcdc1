//! ffmpeg encoder module
//!
//! Builds and runs the libx265 command that re-encodes a source into HEVC,
//! streaming encode progress from ffmpeg's `-progress` output.

use crate::cancellation::CancellationToken;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with non-zero status
    #[error("ffmpeg failed with exit code: {0}")]
    FfmpegFailed(i32),

    /// ffmpeg was terminated by signal
    #[error("ffmpeg process was terminated by signal")]
    FfmpegTerminated,

    /// The encode was cancelled and ffmpeg killed
    #[error("Encode cancelled")]
    Cancelled,

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one HEVC encode
#[derive(Debug, Clone)]
pub struct HevcEncodeParams {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// x265 constant rate factor
    pub crf: u8,
    /// x265 preset name
    pub preset: String,
    /// Source duration, used to turn ffmpeg's output time into a fraction
    pub duration_secs: f64,
}

/// Build the ffmpeg command for `params`.
///
/// Video is re-encoded with libx265 and tagged `hvc1` so players that key
/// on the fourcc accept it; audio and metadata are copied. Progress is
/// written as key=value lines on stdout.
pub fn build_ffmpeg_command(params: &HevcEncodeParams) -> Command {
    let mut cmd = Command::new("ffmpeg");

    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.arg("-i").arg(&params.input_path);

    cmd.arg("-c:v").arg("libx265");
    cmd.arg("-crf").arg(params.crf.to_string());
    cmd.arg("-preset").arg(&params.preset);
    cmd.arg("-tag:v").arg("hvc1");

    cmd.arg("-c:a").arg("copy");
    cmd.arg("-map_metadata").arg("0");

    cmd.arg("-progress").arg("pipe:1");
    cmd.arg("-nostats");

    cmd.arg(&params.output_path);
    cmd
}

/// Extract an encode fraction from one `-progress` line.
///
/// Only `out_time_us` (and its misnamed twin `out_time_ms`, which is also in
/// microseconds) carry position; everything else yields `None`.
pub fn parse_progress_line(line: &str, duration_secs: f64) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    if key != "out_time_us" && key != "out_time_ms" {
        return None;
    }
    if duration_secs <= 0.0 {
        return None;
    }
    let micros: i64 = value.trim().parse().ok()?;
    Some((micros.max(0) as f64 / 1_000_000.0 / duration_secs).clamp(0.0, 1.0))
}

/// Run the encode, reporting progress fractions, and kill ffmpeg if `token`
/// is cancelled first.
pub async fn run_ffmpeg(
    params: &HevcEncodeParams,
    token: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> Result<(), EncodeError> {
    if token.is_cancelling() {
        return Err(EncodeError::Cancelled);
    }

    let mut cmd = tokio::process::Command::from(build_ffmpeg_command(params));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;
    debug!(input = %params.input_path.display(), "ffmpeg started");

    let cancelled = token.cancelled();
    tokio::pin!(cancelled);

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = &mut cancelled => {
                    let _ = child.kill().await;
                    return Err(EncodeError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(fraction) = parse_progress_line(&line, params.duration_secs) {
                            on_progress(fraction);
                        }
                    }
                    None => break,
                },
            }
        }
    }

    let status = tokio::select! {
        _ = &mut cancelled => {
            let _ = child.kill().await;
            return Err(EncodeError::Cancelled);
        }
        status = child.wait() => status?,
    };

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::FfmpegFailed(code)),
            None => Err(EncodeError::FfmpegTerminated),
        }
    }
}
