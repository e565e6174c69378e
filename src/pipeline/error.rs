//! Fatal stage errors.

use crate::supervisor::SupervisorError;
use std::path::PathBuf;
use thiserror::Error;

/// Listing of the nearest existing directory, attached to [`StageError::MissingInput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    /// Directory that was listed.
    pub dir: PathBuf,
    /// Comma-separated entry names; directories carry a trailing `/`.
    pub entries: String,
}

/// Errors that fail a job at the stage that raised them.
#[derive(Debug, Error)]
pub enum StageError {
    /// Discovery matched no file.
    #[error(
        "No ingestable files found in {} ({}). Allowed file types: {allowed}",
        .root.display(),
        describe_scan(.exists, .scanned)
    )]
    NoInputFound {
        /// Root that was scanned.
        root: PathBuf,
        /// Whether the root existed at scan time.
        exists: bool,
        /// Files seen before filtering.
        scanned: usize,
        /// Allow-list, comma-separated.
        allowed: String,
    },
    /// A discovered file disappeared before ingestion.
    #[error(
        "File not found: {}. Check mounts/volume mappings.{}",
        .path.display(),
        describe_listing(.listing)
    )]
    MissingInput {
        /// Missing file.
        path: PathBuf,
        /// Best-effort listing of the nearest existing ancestor.
        listing: Option<DirListing>,
    },
    /// The external stage command failed.
    #[error(transparent)]
    Process(#[from] SupervisorError),
}

fn describe_scan(exists: &bool, scanned: &usize) -> String {
    if *exists {
        format!("scanned {scanned} file(s)")
    } else {
        "root does not exist or is not readable".to_string()
    }
}

fn describe_listing(listing: &Option<DirListing>) -> String {
    match listing {
        Some(listing) => format!(
            " Directory listing ({}): {}",
            listing.dir.display(),
            listing.entries
        ),
        None => String::new(),
    }
}
