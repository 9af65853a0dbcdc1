//! Library scanning: turns configured roots into the ordered item list.
//!
//! Roots are walked recursively, hidden directories are skipped and only
//! video extensions are kept. Each item's key is its canonical path, and
//! the list is ordered newest-modified first.

use crate::item::Item;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Video file extensions picked up by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".m4v", ".mov", ".mkv"];

/// A video file discovered during scanning.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    /// Canonical path to the file.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

impl ScanCandidate {
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn into_item(self) -> Item {
        Item::new(self.key(), self.size_bytes, self.path)
    }
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Walk `roots` and collect every video file, newest first. Missing roots
/// and unreadable entries are logged and skipped.
pub fn scan_candidates(roots: &[PathBuf]) -> Vec<ScanCandidate> {
    use walkdir::WalkDir;

    let mut candidates = Vec::new();

    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "library root does not exist");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            // The root itself may be hidden.
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && entry.file_name().to_str().map(|n| n.starts_with('.')).unwrap_or(false))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_video_file(entry.path()) {
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let path = std::fs::canonicalize(entry.path()).unwrap_or_else(|_| entry.path().to_path_buf());
            candidates.push(ScanCandidate {
                path,
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    candidates.sort_by(|a, b| b.modified_time.cmp(&a.modified_time).then_with(|| a.path.cmp(&b.path)));
    candidates
}

/// Scan `roots` into scheduler items, highest priority (newest) first.
pub fn scan_libraries(roots: &[PathBuf]) -> Vec<Item> {
    let items: Vec<Item> = scan_candidates(roots)
        .into_iter()
        .map(ScanCandidate::into_item)
        .collect();
    debug!(roots = roots.len(), items = items.len(), "scan complete");
    items
}
