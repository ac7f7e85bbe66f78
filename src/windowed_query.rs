//! Windowed descending-size iteration over the Catalog.
//!
//! Spec.md §4.4. Rather than loading every eligible size group at once, the
//! query walks the size axis top-down in fixed-size windows, clearing
//! `has_updates` for everything it passes over — including non-commonality
//! sizes — so a later pass never re-examines unchanged territory.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::model::{Commonality, VolumeId};

/// Size groups considered per window. Matches the original tool's
/// `window_size = 200`.
pub const DEFAULT_WINDOW_SIZE: u32 = 200;

/// Descending-size cursor over a set of volumes' eligible size groups.
pub struct WindowedQuery<'a> {
    catalog: &'a dyn Catalog,
    vols: Vec<VolumeId>,
    window_size: u32,
    /// Upper bound (inclusive) of the next window to fetch; `None` once
    /// exhausted.
    window_start: Option<u64>,
    /// `(window_end, window_start)` of the window last returned by `next`,
    /// pending an `advance` call.
    pending: Option<(u64, u64)>,
}

impl<'a> WindowedQuery<'a> {
    /// Opens a cursor starting at the selected volumes' largest inode size.
    pub fn new(catalog: &'a dyn Catalog, vols: Vec<VolumeId>, window_size: u32) -> Result<Self> {
        let window_start = catalog.max_size(&vols)?;
        Ok(Self {
            catalog,
            vols,
            window_size,
            window_start,
            pending: None,
        })
    }

    /// The total number of eligible size groups remaining across the whole
    /// scan, for progress reporting (`ProgressReporter::set_total`).
    pub fn total_groups(&self) -> Result<u64> {
        self.catalog.total_eligible_groups(&self.vols)
    }

    /// Fetches the next window of commonalities, in descending size order.
    /// Returns `None` once the cursor is exhausted. Callers must call
    /// [`advance`](Self::advance) before requesting the following window.
    pub fn next(&mut self) -> Result<Option<Vec<Commonality>>> {
        let Some(window_start) = self.window_start else {
            return Ok(None);
        };

        let groups = self
            .catalog
            .next_window(&self.vols, window_start, self.window_size)?;
        if groups.is_empty() {
            self.catalog.clear_updates_range(&self.vols, 0, window_start)?;
            self.window_start = None;
            return Ok(None);
        }

        let sizes: Vec<u64> = groups.iter().map(|g| g.size).collect();
        let window_end = *sizes.last().expect("checked non-empty above");

        let inodes = self.catalog.inodes_for_sizes(&self.vols, &sizes)?;
        let mut commonalities: Vec<Commonality> = groups
            .iter()
            .map(|g| Commonality {
                size: g.size,
                inodes: Vec::new(),
            })
            .collect();
        for inode in inodes {
            // `commonalities` is in the same descending-size order as
            // `groups`/`sizes`, and is short (at most `window_size`
            // entries), so a linear scan is simpler than a size->index map.
            if let Some(c) = commonalities.iter_mut().find(|c| c.size == inode.size) {
                c.inodes.push(inode);
            }
        }

        self.pending = Some((window_end, window_start));
        Ok(Some(commonalities))
    }

    /// Clears `has_updates` for the whole `[window_end, window_start]` range
    /// just yielded, then re-flags `still_pending` — inodes the caller
    /// deliberately left unprocessed (deferred for descriptor budget, or
    /// skipped after a local error) and wants revisited next pass.
    pub fn advance(&mut self, still_pending: &[(VolumeId, u64)]) -> Result<()> {
        let (window_end, window_start) = self
            .pending
            .take()
            .expect("advance called without a preceding next()");

        self.catalog
            .clear_updates_range(&self.vols, window_end, window_start)?;
        if !still_pending.is_empty() {
            self.catalog.reflag_inodes(still_pending)?;
        }

        self.window_start = window_end.checked_sub(1);
        Ok(())
    }
}
