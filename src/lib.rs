//! Offline deduplication of regular files on a copy-on-write volume that
//! supports in-kernel extent sharing between files.
//!
//! Given a set of volumes belonging to one filesystem, this crate
//! discovers files whose content is identical and asks the kernel to
//! replace their physically distinct extents with shared references to a
//! single physical extent, reducing disk usage without altering file
//! contents or metadata visible to applications.
//!
//! The pipeline is five components, leaves-first:
//!
//! - [`catalog`] — persistent store of candidate inodes and dedup events.
//! - [`scanner`] — incrementally discovers candidates from the
//!   filesystem's internal tree.
//! - [`checkpointer`] — background WAL-checkpoint worker.
//! - [`windowed_query`] — streams candidate groups from the Catalog in
//!   bounded windows.
//! - [`pipeline`] — the filter cascade and share operations proper.
//!
//! This crate ships one concrete, Linux/Btrfs-specific implementation of
//! each external interface ([`volume_ops::BtrfsVolumeOps`],
//! [`fingerprint::DefaultFingerprintFns`], [`catalog::SqliteCatalog`],
//! [`progress::LoggingProgressReporter`]), but every component depends only
//! on the corresponding trait.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod catalog;
pub mod checkpointer;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod rlimits;
pub mod scanner;
pub mod volume_ops;
pub mod windowed_query;

pub use crate::catalog::{Catalog, SqliteCatalog};
pub use crate::checkpointer::Checkpointer;
pub use crate::error::{PipelineError, Result};
pub use crate::fingerprint::{DefaultFingerprintFns, FingerprintFns};
pub use crate::model::{Commonality, DedupEvent, FilesystemId, Inode, Volume, VolumeId};
pub use crate::pipeline::{DedupPipeline, DedupStats};
pub use crate::progress::{LoggingProgressReporter, NullProgressReporter, ProgressReporter};
pub use crate::volume_ops::{BtrfsVolumeOps, VolumeOps};
pub use crate::windowed_query::WindowedQuery;
