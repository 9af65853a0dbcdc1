//! Version-scoped cache directories.
//!
//! Layout is `<base>/<version>/`. Bumping the version abandons older
//! directories, which are removed in the background.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ensure `<base>/<version>` exists and return it. Directories
/// `<base>/0 ..< <base>/<version>` are deleted asynchronously.
pub fn create(base: &Path, version: u32) -> io::Result<PathBuf> {
    let dir = base.join(version.to_string());
    std::fs::create_dir_all(&dir)?;

    if version > 0 {
        let base = base.to_path_buf();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_older(&base, version));
            }
            Err(_) => remove_older(&base, version),
        }
    }

    Ok(dir)
}

fn remove_older(base: &Path, version: u32) {
    for old in 0..version {
        let path = base.join(old.to_string());
        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale cache version"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale cache version"),
        }
    }
}
