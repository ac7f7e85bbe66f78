//! Persistent store of candidate inodes and dedup events.
//!
//! Spec.md §4.2 and §6. `Catalog` is the abstract interface every other
//! component depends on; [`SqliteCatalog`] is the one concrete
//! implementation this crate ships, backed by SQLite in WAL mode exactly as
//! the original tool was.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{PipelineError, Result};
use crate::model::{DedupEvent, FilesystemId, Inode, VolumeId};

/// A volume's persisted scan watermark.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeWatermark {
    pub last_tracked_generation: Option<u64>,
    pub last_tracked_size_cutoff: Option<u64>,
}

/// One eligible size group, as returned by a windowed scan: size, inode
/// count, and whether at least one member has `has_updates` set.
#[derive(Debug, Clone, Copy)]
pub struct SizeGroupMeta {
    pub size: u64,
    pub inode_count: u64,
}

/// Persisted candidate store and dedup event log.
///
/// Implementations may run under relaxed synchronous commits during a dedup
/// pass (`begin_relaxed_durability`/`restore_full_durability`); losing the
/// most recent `has_updates` clears to a crash is tolerated, since a
/// restarted run simply reprocesses them.
pub trait Catalog {
    /// Registers or updates a volume's static metadata, leaving any existing
    /// watermark untouched.
    fn register_volume(
        &self,
        vol: VolumeId,
        fs: FilesystemId,
        st_dev: u64,
        desc: &str,
        size_cutoff: u64,
    ) -> Result<()>;

    /// Loads a volume's watermark, `None` if the volume has never been
    /// registered.
    fn load_watermark(&self, vol: VolumeId) -> Result<Option<VolumeWatermark>>;

    /// Commits the watermark at the end of a successful scan.
    fn commit_scan_watermark(&self, vol: VolumeId, top_generation: u64, size_cutoff: u64)
        -> Result<()>;

    /// Upserts `(vol, ino)`, setting `size` and `has_updates = true`.
    fn upsert_inode(&self, vol: VolumeId, ino: u64, size: u64) -> Result<()>;

    /// Deletes an inode row. Used whenever the row is discovered to be
    /// stale: the inode is gone, moved, replaced, or shrank below cutoff.
    fn delete_inode(&self, vol: VolumeId, ino: u64) -> Result<()>;

    /// Sets `has_updates = true` on a specific set of `(vol, ino)` pairs,
    /// regardless of size. Used to re-flag inodes deferred mid-window.
    fn reflag_inodes(&self, pairs: &[(VolumeId, u64)]) -> Result<()>;

    /// The maximum size across all inodes of the selected volumes
    /// (updated or not) — the initial `window_start`, so that even
    /// non-commonality sizes get their `has_updates` flag cleared.
    fn max_size(&self, vols: &[VolumeId]) -> Result<Option<u64>>;

    /// The total number of eligible size groups (`inode_count >= 2` and at
    /// least one member with `has_updates`), for progress reporting.
    fn total_eligible_groups(&self, vols: &[VolumeId]) -> Result<u64>;

    /// The next (at most `limit`) eligible size groups with
    /// `size <= window_start`, in descending size order.
    fn next_window(
        &self,
        vols: &[VolumeId],
        window_start: u64,
        limit: u32,
    ) -> Result<Vec<SizeGroupMeta>>;

    /// All inodes of the selected volumes whose size is one of `sizes`,
    /// ordered `(size desc, ino asc)`.
    fn inodes_for_sizes(&self, vols: &[VolumeId], sizes: &[u64]) -> Result<Vec<Inode>>;

    /// Clears `has_updates` for all inodes of the selected volumes whose
    /// size falls in `[window_end, window_start]` (inclusive both ends).
    fn clear_updates_range(&self, vols: &[VolumeId], window_end: u64, window_start: u64)
        -> Result<()>;

    /// Appends a DedupEvent and its participating inodes, then commits.
    fn append_dedup_event(&self, event: &DedupEvent) -> Result<()>;

    /// Forgets all Inode rows for a volume and resets its generation
    /// watermark to 0, forcing a full rescan. Mirrors the original tool's
    /// `reset_vol`: the size-cutoff watermark is left untouched.
    fn reset_volume(&self, vol: VolumeId) -> Result<()>;

    /// Re-flags the inodes participating in up to `max_events` past
    /// DedupEvents. Returns the number of events with at least two
    /// still-extant participating inodes, mirroring the original's
    /// `fake_updates` counter.
    fn refresh_from_events(&self, max_events: u64) -> Result<u64>;

    /// Switches to relaxed durability for the duration of a dedup pass:
    /// `synchronous=NORMAL`, auto-checkpointing disabled.
    fn begin_relaxed_durability(&self) -> Result<()>;

    /// Restores full-fsync durability for the pass's terminal commit.
    fn restore_full_durability(&self) -> Result<()>;

    /// Issues a WAL checkpoint. Best-effort; failures should be logged by
    /// the caller and never propagated as fatal.
    fn wal_checkpoint(&self) -> Result<()>;
}

/// SQLite-backed [`Catalog`], running in WAL mode.
pub struct SqliteCatalog {
    conn: Connection,
    db_path: PathBuf,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS volumes (
    id INTEGER PRIMARY KEY,
    fs_id INTEGER NOT NULL,
    st_dev INTEGER NOT NULL,
    desc TEXT NOT NULL,
    size_cutoff INTEGER NOT NULL,
    last_tracked_generation INTEGER,
    last_tracked_size_cutoff INTEGER
);
CREATE TABLE IF NOT EXISTS inodes (
    vol_id INTEGER NOT NULL,
    ino INTEGER NOT NULL,
    size INTEGER NOT NULL,
    has_updates INTEGER NOT NULL,
    PRIMARY KEY (vol_id, ino)
);
CREATE INDEX IF NOT EXISTS inodes_size_idx ON inodes(size);
CREATE TABLE IF NOT EXISTS dedup_events (
    id INTEGER PRIMARY KEY,
    fs_id INTEGER NOT NULL,
    item_size INTEGER NOT NULL,
    created INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS dedup_event_inodes (
    event_id INTEGER NOT NULL,
    vol_id INTEGER NOT NULL,
    ino INTEGER NOT NULL,
    PRIMARY KEY (event_id, vol_id, ino)
);
";

impl SqliteCatalog {
    /// Opens (creating if necessary) a catalog database at `path`, in WAL
    /// mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, db_path })
    }

    /// Opens a second, independent connection to the same database file,
    /// for the [`crate::checkpointer::Checkpointer`]'s exclusive use so it
    /// never contends with the foreground connection.
    pub fn open_checkpoint_connection(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }

    fn in_clause(vols: &[VolumeId]) -> String {
        let mut s = String::from("(");
        for (i, v) in vols.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            let _ = write!(s, "{}", v.0);
        }
        s.push(')');
        s
    }
}

impl Catalog for SqliteCatalog {
    fn register_volume(
        &self,
        vol: VolumeId,
        fs: FilesystemId,
        st_dev: u64,
        desc: &str,
        size_cutoff: u64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO volumes (id, fs_id, st_dev, desc, size_cutoff) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (id) DO UPDATE SET \
               fs_id = excluded.fs_id, \
               st_dev = excluded.st_dev, \
               desc = excluded.desc, \
               size_cutoff = excluded.size_cutoff",
            params![vol.0, fs.0, st_dev as i64, desc, size_cutoff as i64],
        )?;
        Ok(())
    }

    fn load_watermark(&self, vol: VolumeId) -> Result<Option<VolumeWatermark>> {
        let row: Option<(Option<i64>, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT last_tracked_generation, last_tracked_size_cutoff \
                 FROM volumes WHERE id = ?1",
                params![vol.0],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(gen, cutoff)| VolumeWatermark {
            last_tracked_generation: gen.map(|g| g as u64),
            last_tracked_size_cutoff: cutoff.map(|c| c as u64),
        }))
    }

    fn commit_scan_watermark(
        &self,
        vol: VolumeId,
        top_generation: u64,
        size_cutoff: u64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE volumes SET last_tracked_generation = ?2, last_tracked_size_cutoff = ?3 \
                 WHERE id = ?1",
                params![vol.0, top_generation as i64, size_cutoff as i64],
            )
            .map_err(PipelineError::Commit)?;
        Ok(())
    }

    fn upsert_inode(&self, vol: VolumeId, ino: u64, size: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO inodes (vol_id, ino, size, has_updates) VALUES (?1, ?2, ?3, 1) \
             ON CONFLICT (vol_id, ino) DO UPDATE SET size = excluded.size, has_updates = 1",
            params![vol.0, ino as i64, size as i64],
        )?;
        Ok(())
    }

    fn delete_inode(&self, vol: VolumeId, ino: u64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM inodes WHERE vol_id = ?1 AND ino = ?2",
            params![vol.0, ino as i64],
        )?;
        Ok(())
    }

    fn reflag_inodes(&self, pairs: &[(VolumeId, u64)]) -> Result<()> {
        for (vol, ino) in pairs {
            self.conn.execute(
                "UPDATE inodes SET has_updates = 1 WHERE vol_id = ?1 AND ino = ?2",
                params![vol.0, *ino as i64],
            )?;
        }
        Ok(())
    }

    fn max_size(&self, vols: &[VolumeId]) -> Result<Option<u64>> {
        if vols.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT MAX(size) FROM inodes WHERE vol_id IN {}",
            Self::in_clause(vols)
        );
        let max: Option<i64> = self.conn.query_row(&sql, params![], |r| r.get(0))?;
        Ok(max.map(|m| m as u64))
    }

    fn total_eligible_groups(&self, vols: &[VolumeId]) -> Result<u64> {
        if vols.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM ( \
               SELECT size FROM inodes WHERE vol_id IN {} \
               GROUP BY size HAVING COUNT(*) >= 2 AND MAX(has_updates) > 0 \
             )",
            Self::in_clause(vols)
        );
        let count: i64 = self.conn.query_row(&sql, params![], |r| r.get(0))?;
        Ok(count as u64)
    }

    fn next_window(
        &self,
        vols: &[VolumeId],
        window_start: u64,
        limit: u32,
    ) -> Result<Vec<SizeGroupMeta>> {
        if vols.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT size, COUNT(*) AS inode_count FROM inodes \
             WHERE vol_id IN {} AND size <= ?1 \
             GROUP BY size HAVING inode_count >= 2 AND MAX(has_updates) > 0 \
             ORDER BY size DESC LIMIT ?2",
            Self::in_clause(vols)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![window_start as i64, limit], |r| {
            Ok(SizeGroupMeta {
                size: r.get::<_, i64>(0)? as u64,
                inode_count: r.get::<_, i64>(1)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn inodes_for_sizes(&self, vols: &[VolumeId], sizes: &[u64]) -> Result<Vec<Inode>> {
        if vols.is_empty() || sizes.is_empty() {
            return Ok(Vec::new());
        }
        let mut size_list = String::new();
        for (i, s) in sizes.iter().enumerate() {
            if i > 0 {
                size_list.push(',');
            }
            let _ = write!(size_list, "{s}");
        }
        let sql = format!(
            "SELECT vol_id, ino, size, has_updates FROM inodes \
             WHERE vol_id IN {} AND size IN ({}) \
             ORDER BY size DESC, ino ASC",
            Self::in_clause(vols),
            size_list
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![], |r| {
            Ok(Inode {
                vol: VolumeId(r.get::<_, i64>(0)?),
                ino: r.get::<_, i64>(1)? as u64,
                size: r.get::<_, i64>(2)? as u64,
                has_updates: r.get::<_, i64>(3)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn clear_updates_range(
        &self,
        vols: &[VolumeId],
        window_end: u64,
        window_start: u64,
    ) -> Result<()> {
        if vols.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE inodes SET has_updates = 0 \
             WHERE vol_id IN {} AND size >= ?1 AND size <= ?2",
            Self::in_clause(vols)
        );
        self.conn
            .execute(&sql, params![window_end as i64, window_start as i64])?;
        Ok(())
    }

    fn append_dedup_event(&self, event: &DedupEvent) -> Result<()> {
        let created = event
            .created
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.conn
            .execute(
                "INSERT INTO dedup_events (fs_id, item_size, created) VALUES (?1, ?2, ?3)",
                params![event.fs.0, event.item_size as i64, created],
            )
            .map_err(PipelineError::Commit)?;
        let event_id = self.conn.last_insert_rowid();
        for (vol, ino) in &event.inodes {
            self.conn
                .execute(
                    "INSERT INTO dedup_event_inodes (event_id, vol_id, ino) VALUES (?1, ?2, ?3)",
                    params![event_id, vol.0, *ino as i64],
                )
                .map_err(PipelineError::Commit)?;
        }
        Ok(())
    }

    fn reset_volume(&self, vol: VolumeId) -> Result<()> {
        self.conn
            .execute("DELETE FROM inodes WHERE vol_id = ?1", params![vol.0])?;
        self.conn.execute(
            "UPDATE volumes SET last_tracked_generation = 0 WHERE id = ?1",
            params![vol.0],
        )?;
        Ok(())
    }

    fn refresh_from_events(&self, max_events: u64) -> Result<u64> {
        let mut event_stmt = self
            .conn
            .prepare("SELECT id FROM dedup_events ORDER BY id LIMIT ?1")?;
        let event_ids: Vec<i64> = event_stmt
            .query_map(params![max_events as i64], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(event_stmt);

        let mut faked = 0u64;
        for event_id in event_ids {
            let mut inode_stmt = self
                .conn
                .prepare("SELECT vol_id, ino FROM dedup_event_inodes WHERE event_id = ?1")?;
            let pairs: Vec<(i64, i64)> = inode_stmt
                .query_map(params![event_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            drop(inode_stmt);

            let mut ino_count = 0u64;
            for (vol_id, ino) in pairs {
                let exists: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT 1 FROM inodes WHERE vol_id = ?1 AND ino = ?2",
                        params![vol_id, ino],
                        |r| r.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    continue;
                }
                self.conn.execute(
                    "UPDATE inodes SET has_updates = 1 WHERE vol_id = ?1 AND ino = ?2",
                    params![vol_id, ino],
                )?;
                ino_count += 1;
            }
            if ino_count > 1 {
                faked += 1;
            }
        }
        Ok(faked)
    }

    fn begin_relaxed_durability(&self) -> Result<()> {
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "wal_autocheckpoint", 0)?;
        Ok(())
    }

    fn restore_full_durability(&self) -> Result<()> {
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        Ok(())
    }

    fn wal_checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint;")?;
        Ok(())
    }
}

/// Wall-clock timestamp helper, so callers don't reach for `SystemTime::now`
/// directly inline at every call site that builds a [`DedupEvent`].
pub fn system_now() -> SystemTime {
    SystemTime::now()
}
