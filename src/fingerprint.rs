//! Cheap, low-selectivity fingerprints used to prune the candidate set
//! before full-content hashing.
//!
//! Spec.md §6 treats `FingerprintFns` as a consumed interface ("must be
//! deterministic pure functions of file content/layout"); this module
//! supplies [`DefaultFingerprintFns`], a concrete implementation good
//! enough to drive the funnel end to end.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::volume_ops::VolumeOps;

/// Cheap content/layout fingerprints consumed by Stage 2 and Stage 3 of the
/// DedupPipeline.
pub trait FingerprintFns {
    /// A cheap fingerprint of `file`'s content, used to partition a
    /// same-size group before any full read. Must be a deterministic
    /// function of the file's bytes (and may use `inode.size` as a hint).
    fn mini_hash(&self, size: u64, file: &mut File) -> io::Result<Vec<u8>>;

    /// A fingerprint of `file`'s extent map. Two files already sharing
    /// extents must produce the same fingerprint.
    fn fiemap_hash(&self, file: &File, vol_ops: &dyn VolumeOps) -> io::Result<Vec<u8>>;
}

/// Samples a handful of fixed offsets rather than hashing the whole file,
/// trading selectivity for speed — exactly the role `mini_hash` plays in
/// spec.md §4.5 Stage 2: quickly discard files that plainly differ, without
/// yet paying for a full read.
#[derive(Debug, Default)]
pub struct DefaultFingerprintFns;

/// Byte window read at each sample offset.
const SAMPLE_SIZE: usize = 4096;

/// Fractional offsets (of the file's size) sampled by `mini_hash`, chosen to
/// catch differences concentrated at the start, middle or end of a file
/// (e.g. differing headers or trailers) while still reading only a few
/// kilobytes for a multi-gigabyte file.
const SAMPLE_FRACTIONS: [f64; 3] = [0.0, 0.5, 0.95];

impl FingerprintFns for DefaultFingerprintFns {
    fn mini_hash(&self, size: u64, file: &mut File) -> io::Result<Vec<u8>> {
        use sha1::{Digest, Sha1};

        let mut hasher = Sha1::new();
        hasher.update(size.to_le_bytes());
        let mut buf = [0u8; SAMPLE_SIZE];
        for frac in SAMPLE_FRACTIONS {
            let offset = ((size as f64) * frac) as u64;
            file.seek(SeekFrom::Start(offset))?;
            let mut total_read = 0usize;
            while total_read < buf.len() {
                let n = file.read(&mut buf[total_read..])?;
                if n == 0 {
                    break;
                }
                total_read += n;
            }
            hasher.update(&buf[..total_read]);
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(hasher.finalize().to_vec())
    }

    fn fiemap_hash(&self, file: &File, vol_ops: &dyn VolumeOps) -> io::Result<Vec<u8>> {
        vol_ops.fiemap_hash(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mini_hash_distinguishes_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        std::fs::write(&path_a, vec![1u8; 10_000]).unwrap();
        std::fs::write(&path_b, vec![2u8; 10_000]).unwrap();

        let fp = DefaultFingerprintFns;
        let mut fa = File::open(&path_a).unwrap();
        let mut fb = File::open(&path_b).unwrap();
        let ha = fp.mini_hash(10_000, &mut fa).unwrap();
        let hb = fp.mini_hash(10_000, &mut fb).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn mini_hash_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![7u8; 20_000]).unwrap();
        drop(f);

        let fp = DefaultFingerprintFns;
        let mut f1 = File::open(&path).unwrap();
        let mut f2 = File::open(&path).unwrap();
        let h1 = fp.mini_hash(20_000, &mut f1).unwrap();
        let h2 = fp.mini_hash(20_000, &mut f2).unwrap();
        assert_eq!(h1, h2);
    }
}
