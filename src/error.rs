//! Error types for the dedup pipeline.
//!
//! Most errors in this crate are handled locally per spec.md §7 (a stale
//! inode is deleted, a busy file is re-flagged, ...) and never surface past
//! the module that observed them. [`PipelineError`] carries only the
//! dispositions that table marks *fatal*.

use std::fmt;
use std::io;

/// A fatal error that aborts a scan or a dedup pass.
#[derive(Debug)]
pub enum PipelineError {
    /// The tree-search primitive failed; per spec.md §4.1 this is fatal to
    /// the whole scan.
    TreeSearch(io::Error),
    /// A Catalog commit failed; fatal at any site per spec.md §7.
    Commit(rusqlite::Error),
    /// Any other Catalog operation failed.
    Catalog(rusqlite::Error),
    /// Two files had matching cryptographic digests but differed byte for
    /// byte. Spec.md §4.5 Stage 6 calls this a defect warranting
    /// investigation, not a silent fallthrough.
    DigestCollision {
        /// Path of the elected source file.
        source: String,
        /// Path of the file that failed the byte comparison.
        destination: String,
    },
    /// Any other I/O failure not classified as a locally-handled race.
    Io(io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::TreeSearch(e) => write!(f, "tree search failed: {e}"),
            PipelineError::Commit(e) => write!(f, "catalog commit failed: {e}"),
            PipelineError::Catalog(e) => write!(f, "catalog operation failed: {e}"),
            PipelineError::DigestCollision { source, destination } => write!(
                f,
                "digest collision: {source:?} and {destination:?} hash identically \
                 but differ byte for byte"
            ),
            PipelineError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::TreeSearch(e) | PipelineError::Io(e) => Some(e),
            PipelineError::Commit(e) | PipelineError::Catalog(e) => Some(e),
            PipelineError::DigestCollision { .. } => None,
        }
    }
}

impl From<io::Error> for PipelineError {
    fn from(e: io::Error) -> Self {
        PipelineError::Io(e)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Catalog(e)
    }
}

/// Convenience alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, PipelineError>;
