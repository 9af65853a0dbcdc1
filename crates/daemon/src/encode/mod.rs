//! HEVC encoding with ffmpeg

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, parse_progress_line, run_ffmpeg, EncodeError, HevcEncodeParams};
