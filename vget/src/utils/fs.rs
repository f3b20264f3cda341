//! Filesystem helpers for staging and cleanup.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{OperationError, Result};

/// Suffixes the extractor leaves behind for in-flight downloads.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

/// Ensure a directory exists, creating parents as needed.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| OperationError::io(path, source))
}

/// Remove partial artifacts left by an aborted attempt.
///
/// Deletes files in `dir` whose name starts with `stem` and carries a
/// partial-download suffix, so a later retry never resumes from a stale
/// fragment. Returns the number of files removed; individual failures are
/// logged and skipped.
pub async fn cleanup_partial_artifacts(dir: &Path, stem: &str) -> u32 {
    let mut removed = 0u32;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return removed;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(stem) || !is_partial(name) {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed partial artifact");
                removed += 1;
            }
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "failed to remove partial artifact");
            }
        }
    }
    removed
}

fn is_partial(name: &str) -> bool {
    // Fragment partials look like `stem.f137.mp4.part-Frag3`.
    PARTIAL_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix) || name.contains(&format!("{suffix}-")))
}

/// Find the completed artifact for `stem` in `dir`.
///
/// The extractor expands its own extension template, so the exact output
/// name is only known after the fact. Partial files never qualify; among
/// multiple matches the largest wins (the merged/muxed result).
pub async fn find_artifact(dir: &Path, stem: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut best: Option<(u64, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(stem) || is_partial(name) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let size = meta.len();
        if best.as_ref().is_none_or(|(s, _)| size > *s) {
            best = Some((size, entry.path()));
        }
    }

    best.map(|(_, path)| path)
}
