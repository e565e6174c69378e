//! Input discovery and missing-input diagnostics.

use crate::pipeline::error::{DirListing, StageError};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const LISTING_LIMIT: usize = 15;

/// Files accepted under a root, with scan counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Accepted files in walk order (sorted by name per directory).
    pub files: Vec<PathBuf>,
    /// Files seen.
    pub scanned: usize,
    /// Files rejected by the allow-list.
    pub skipped: usize,
}

/// Recursively collect files under `root` whose lowercase suffix is in `allowed`.
///
/// Unreadable entries are logged and skipped. Zero matches is a [`StageError::NoInputFound`].
pub fn discover(root: &Path, allowed: &[String]) -> Result<Discovered, StageError> {
    let mut files = Vec::new();
    let mut scanned = 0;
    let mut skipped = 0;

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(root = %root.display(), error = %error, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        scanned += 1;
        if has_allowed_suffix(entry.path(), allowed) {
            files.push(entry.into_path());
        } else {
            skipped += 1;
        }
    }

    tracing::info!(
        root = %root.display(),
        scanned,
        accepted = files.len(),
        skipped,
        allowed = %allowed.join(", "),
        "Scanned ingestion root"
    );

    if files.is_empty() {
        return Err(StageError::NoInputFound {
            root: root.to_path_buf(),
            exists: root.is_dir(),
            scanned,
            allowed: allowed.join(", "),
        });
    }

    Ok(Discovered {
        files,
        scanned,
        skipped,
    })
}

fn has_allowed_suffix(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| format!(".{}", extension.to_lowercase()))
        .is_some_and(|suffix| allowed.iter().any(|candidate| *candidate == suffix))
}

/// List the nearest existing ancestor directory of `missing`, falling back to `root`.
///
/// Best effort: any failure yields `None` so the caller's error stays intact.
pub fn nearest_listing(missing: &Path, root: &Path) -> Option<DirListing> {
    let dir = missing
        .ancestors()
        .skip(1)
        .find(|candidate| candidate.is_dir())
        .unwrap_or(root);
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => format!("{name}/"),
                _ => name,
            }
        })
        .collect();
    names.sort();
    names.truncate(LISTING_LIMIT);
    let entries = if names.is_empty() {
        "(empty)".to_string()
    } else {
        names.join(", ")
    };
    Some(DirListing {
        dir: dir.to_path_buf(),
        entries,
    })
}
