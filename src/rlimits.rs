//! Open-files resource-limit budget.
//!
//! Spec.md §4.5, §9: the open-files soft/hard limit is process-wide state;
//! the budget itself is computed per group, not per process. Wraps
//! `getrlimit`/`setrlimit(RLIMIT_NOFILE)` via the `rlimit` crate.

use std::io;

/// The current soft/hard open-files limit.
#[derive(Debug, Clone, Copy)]
pub struct OpenFilesLimit {
    pub soft: u64,
    pub hard: u64,
}

/// Reads the process's current `RLIMIT_NOFILE`.
pub fn current() -> io::Result<OpenFilesLimit> {
    let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)?;
    Ok(OpenFilesLimit { soft, hard })
}

/// Raises the soft `RLIMIT_NOFILE` to `new_soft`, keeping the hard limit
/// unchanged. Fails if `new_soft` exceeds the hard limit.
pub fn raise_soft(new_soft: u64, hard: u64) -> io::Result<()> {
    rlimit::setrlimit(rlimit::Resource::NOFILE, new_soft, hard)
}

/// Reserved descriptors outside the per-candidate budget: stdio, the
/// Catalog's own WAL-mode handles, and a couple of slack descriptors,
/// plus one per volume (spec.md §4.5). Matches the original tool's
/// `ofile_reserved = 7 + len(volset)` exactly.
pub fn reserved(volume_count: usize) -> u64 {
    7 + volume_count as u64
}

/// The descriptor budget required to process a group of `n` candidates:
/// two descriptors per candidate (one read-only lookup during the
/// fingerprint stages, one read-write handle during hashing/sharing) plus
/// the reserved baseline.
pub fn required_for_group(n: usize, reserved: u64) -> u64 {
    2 * n as u64 + reserved
}

/// Ensures the soft limit can accommodate `required`. Returns `Ok(true)` if
/// the budget fits (raising the soft limit if necessary), `Ok(false)` if it
/// exceeds even the hard limit and the group must be deferred.
pub fn ensure_budget(required: u64) -> io::Result<bool> {
    let limit = current()?;
    if required <= limit.soft {
        return Ok(true);
    }
    if required <= limit.hard {
        raise_soft(required, limit.hard)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_matches_formula() {
        assert_eq!(reserved(0), 7);
        assert_eq!(reserved(3), 10);
    }

    #[test]
    fn required_for_group_doubles_and_adds_reserved() {
        assert_eq!(required_for_group(600, 8), 1208);
    }
}
