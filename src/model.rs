//! Data model: [`Filesystem`], [`Volume`], [`Inode`], [`DedupEvent`].
//!
//! Mirrors spec.md §3. A `Filesystem` owns its `Volume`s; a `Volume` owns the
//! `Inode` rows scoped to it in the Catalog. `DedupEvent` references volumes
//! and inodes by identity only — the referent may since have been deleted.

use std::os::unix::io::RawFd;
use std::time::SystemTime;

/// Identifies one Btrfs filesystem shared by one or more mounted volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilesystemId(pub i64);

/// Identifies one mounted subtree with its own generation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub i64);

/// One mounted subtree of a [`Filesystem`].
///
/// `last_tracked_generation` and `last_tracked_size_cutoff` are the only
/// inter-run state required for correct incremental scanning; both are
/// mutated only by the Scanner, at the end of a successful scan.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: VolumeId,
    pub fs: FilesystemId,
    /// Open handle to the root of the subtree, used for `tree_search` and
    /// path lookups. `None` for rows loaded purely for their watermark
    /// (e.g. by administrative operations).
    pub fd: Option<RawFd>,
    /// Device identifier, used for the identity recheck in Stage 5.
    pub st_dev: u64,
    /// Human-readable description, used only for progress narration.
    pub desc: String,
    /// Minimum file size considered for dedup this run.
    pub size_cutoff: u64,
    /// Watermark of the last successful scan; `None` before the first scan.
    pub last_tracked_generation: Option<u64>,
    /// Cutoff in force during the scan that set `last_tracked_generation`.
    pub last_tracked_size_cutoff: Option<u64>,
}

impl Volume {
    /// The lower generation bound a scan should use, per spec.md §4.1: if
    /// the prior cutoff was set and is no larger than the current one,
    /// every previously-seen candidate is still a candidate, so only newer
    /// generations add work; otherwise the cutoff shrank and the whole
    /// history must be rescanned. Takes the watermark explicitly (rather
    /// than reading `self.last_tracked_generation`/`last_tracked_size_cutoff`)
    /// because the Scanner treats the Catalog's persisted watermark, not
    /// whatever happens to be cached on this struct, as authoritative.
    pub fn scan_lower_bound(&self, last_tracked_generation: Option<u64>, last_tracked_size_cutoff: Option<u64>) -> u64 {
        match (last_tracked_size_cutoff, last_tracked_generation) {
            (Some(prior_cutoff), Some(last_gen)) if prior_cutoff <= self.size_cutoff => {
                last_gen + 1
            }
            _ => 0,
        }
    }
}

/// A persisted candidate row: one regular file discovered by the Scanner.
///
/// Invariants (spec.md §3): `(vol, ino)` is unique; `size >= vol.size_cutoff`
/// at insertion time; `has_updates=true` means the row may participate in
/// the next dedup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub vol: VolumeId,
    pub ino: u64,
    pub size: u64,
    pub has_updates: bool,
}

/// A log entry recording one successful share operation group. Append-only.
#[derive(Debug, Clone)]
pub struct DedupEvent {
    pub fs: FilesystemId,
    pub item_size: u64,
    pub created: SystemTime,
    pub inodes: Vec<(VolumeId, u64)>,
}

/// One size-grouped batch of candidates as yielded by `WindowedQuery`:
/// `(size, inode_count, inodes)` in spec.md's own vocabulary.
#[derive(Debug, Clone)]
pub struct Commonality {
    pub size: u64,
    pub inodes: Vec<Inode>,
}

impl Commonality {
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }
}
