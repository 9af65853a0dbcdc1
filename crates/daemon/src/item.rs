//! Work items and the artifacts the pipeline produces for them.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Savings ratio an output must exceed before it is worth applying.
pub const DEFAULT_MIN_SAVINGS_RATIO: f32 = 0.05;

/// A unit of work: one video in the collection.
///
/// Identity is the `key` alone; the other fields are attributes supplied by
/// whoever enumerated the collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Stable identity, also the key in every cache namespace.
    pub key: String,
    /// Size of the source in bytes at enumeration time.
    pub size_bytes: u64,
    /// Location of the source.
    pub source: PathBuf,
}

impl Item {
    pub fn new(key: impl Into<String>, size_bytes: u64, source: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            size_bytes,
            source: source.into(),
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Item {}

impl Hash for Item {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Codec of an item's primary video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    /// H.264 / AVC
    Avc1,
    /// H.265 / HEVC
    Hvc1,
    Unknown,
}

impl VideoCodec {
    /// Only H.264 sources are worth re-encoding.
    pub fn should_attempt_transcode(&self) -> bool {
        *self == VideoCodec::Avc1
    }

    pub fn friendly_name(&self) -> &'static str {
        match self {
            VideoCodec::Avc1 => "h264",
            VideoCodec::Hvc1 => "hevc",
            VideoCodec::Unknown => "unknown",
        }
    }

    /// Map an ffprobe `codec_name` (or a fourcc tag) to a codec.
    pub fn from_codec_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "h264" | "avc" | "avc1" => VideoCodec::Avc1,
            "hevc" | "h265" | "hvc1" | "hev1" => VideoCodec::Hvc1,
            _ => VideoCodec::Unknown,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.friendly_name())
    }
}

/// Result of a successful transcode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TranscodeStats {
    pub original_file_size: u64,
    pub transcoded_file_size: u64,
    pub download_seconds: f32,
    pub encode_seconds: f32,
}

impl TranscodeStats {
    /// Bytes saved by the transcode; negative when the output grew.
    pub fn raw_savings_bytes(&self) -> i64 {
        self.original_file_size as i64 - self.transcoded_file_size as i64
    }

    pub fn raw_savings_ratio(&self) -> f32 {
        if self.original_file_size == 0 {
            return 0.0;
        }
        self.raw_savings_bytes() as f32 / self.original_file_size as f32
    }

    /// Savings must be strictly greater than `min_ratio`.
    pub fn should_apply(&self, min_ratio: f32) -> bool {
        self.raw_savings_ratio() > min_ratio
    }

    pub fn applicable_savings_bytes(&self, min_ratio: f32) -> Option<u64> {
        if self.should_apply(min_ratio) {
            Some(self.raw_savings_bytes() as u64)
        } else {
            None
        }
    }
}

/// Size statistics recorded when an item is inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub original_file_name: Option<String>,
}
