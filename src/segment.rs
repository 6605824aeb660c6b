//! Segment file management.
//!
//! A WAL directory holds numbered segment files named `segment-<N>` with a
//! bare decimal index (no padding). A segment is a plain concatenation of
//! record frames; there is no file header. The store keeps no cached view
//! of the directory, every operation rescans it.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tracing::debug;

use crate::error::{WalError, WalResult};

/// File name prefix for segment files.
pub(crate) const SEGMENT_PREFIX: &str = "segment-";

/// Returns the path of the segment with the given index.
pub(crate) fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index}"))
}

/// Lists segment files in the directory, sorted by numeric index.
///
/// Files that do not start with the `segment-` prefix are ignored. A file
/// that matches the prefix but whose suffix is not a valid integer fails
/// with [`WalError::MalformedSegmentName`].
///
/// The returned list is ordered oldest first; the active segment (largest
/// index) is last.
pub(crate) async fn list_segments(dir: &Path) -> WalResult<Vec<(u64, PathBuf)>> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| WalError::io("read_dir", e))?;

    let mut segments = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WalError::io("read_dir_entry", e))?
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(suffix) = name.strip_prefix(SEGMENT_PREFIX) else {
            continue;
        };
        let index = suffix
            .parse::<u64>()
            .map_err(|_| WalError::MalformedSegmentName {
                name: name.to_string(),
            })?;
        segments.push((index, path));
    }

    segments.sort_unstable_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Creates (or opens) the segment with the given index for appending.
pub(crate) async fn create_segment(dir: &Path, index: u64) -> WalResult<File> {
    let path = segment_path(dir, index);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| WalError::io("create_segment", e))?;
    debug!(index, path = %path.display(), "opened segment for append");
    Ok(file)
}

/// Removes a segment file.
pub(crate) async fn remove_segment(path: &Path) -> WalResult<()> {
    fs::remove_file(path)
        .await
        .map_err(|e| WalError::io("remove_segment", e))
}
