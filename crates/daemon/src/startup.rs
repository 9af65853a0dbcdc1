//! Startup checks module
//!
//! Preflight checks run before the daemon starts sweeping:
//! - ffmpeg and ffprobe must be runnable
//! - the cache, staging and output directories must be creatable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Required tool not available: {0}")]
    ToolUnavailable(String),

    #[error("Cannot prepare directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse the major version from `ffmpeg -version` / `ffprobe -version`.
///
/// Handles both the release form (`ffmpeg version 6.1.1 ...`) and the
/// git-build form (`ffmpeg version n6.1-...`).
pub fn parse_tool_version(tool: &str, version_output: &str) -> Option<u32> {
    let marker = format!("{} version", tool);
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let version_part = version_line
        .to_lowercase()
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Check that `tool -version` runs, returning its major version if it
/// could be parsed.
pub fn check_tool_available(tool: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(tool).arg("-version").output().map_err(|e| {
        StartupError::ToolUnavailable(format!("{} -version failed; is it in PATH? Error: {}", tool, e))
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable(format!(
            "{} -version exited with {}",
            tool, output.status
        )));
    }

    Ok(parse_tool_version(tool, &String::from_utf8_lossy(&output.stdout)))
}

/// Create `path` if missing.
pub fn ensure_directory(path: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(path).map_err(|source| StartupError::Directory {
        path: path.display().to_string(),
        source,
    })
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
/// 3. working directories
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    for tool in ["ffmpeg", "ffprobe"] {
        let version = check_tool_available(tool)?;
        info!(tool, version = ?version, "tool available");
    }

    for dir in [&cfg.cache.dir, &cfg.encode.staging_dir, &cfg.encode.output_dir] {
        ensure_directory(dir)?;
    }

    Ok(())
}
