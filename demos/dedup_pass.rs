//! Drives one scan-then-dedup pass over a set of directories on the same
//! Btrfs filesystem.
//!
//! This is a thin wrapper around [`bdedup`]'s components, standing in for
//! the CLI surface spec.md places out of scope: argument parsing and
//! progress display are handled here with `clap` and `env_logger`, exactly
//! as the library's tests treat both as consumed collaborators.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use clap::Parser;

use bdedup::catalog::SqliteCatalog;
use bdedup::checkpointer::Checkpointer;
use bdedup::fingerprint::DefaultFingerprintFns;
use bdedup::model::{FilesystemId, Volume, VolumeId};
use bdedup::pipeline::DedupPipeline;
use bdedup::progress::LoggingProgressReporter;
use bdedup::scanner;
use bdedup::volume_ops::BtrfsVolumeOps;
use bdedup::windowed_query::DEFAULT_WINDOW_SIZE;

/// Scan a set of Btrfs subvolumes and deduplicate identical files between
/// them.
#[derive(Parser, Debug)]
#[command(name = "dedup_pass", about = "One scan-then-dedup pass over a Btrfs filesystem")]
struct Args {
    /// Path to the catalog database (created if it doesn't exist).
    #[arg(long, default_value = "dedup.sqlite")]
    catalog: PathBuf,

    /// Minimum file size, in bytes, considered for deduplication.
    #[arg(long, default_value_t = 4096)]
    size_cutoff: u64,

    /// One or more directories on the same Btrfs filesystem to scan and
    /// deduplicate between.
    #[arg(required = true)]
    volumes: Vec<PathBuf>,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let catalog_path = args.catalog.clone();
    let catalog = SqliteCatalog::open(&args.catalog).map_err(to_io_error)?;
    let vol_ops = BtrfsVolumeOps;
    let fingerprint = DefaultFingerprintFns;
    let progress = LoggingProgressReporter::new();

    let fs = FilesystemId(0);
    let mut volumes = Vec::with_capacity(args.volumes.len());
    // Kept open for the lifetime of the pass: `tree_search`, path lookups
    // and opens are all relative to this root handle.
    let mut root_handles = Vec::with_capacity(args.volumes.len());

    for (i, path) in args.volumes.iter().enumerate() {
        let root = File::open(path)?;
        let st_dev = std::fs::metadata(path)?.dev();
        let vol = Volume {
            id: VolumeId(i as i64),
            fs,
            fd: Some(root.as_raw_fd()),
            st_dev,
            desc: path.display().to_string(),
            size_cutoff: args.size_cutoff,
            last_tracked_generation: None,
            last_tracked_size_cutoff: None,
        };
        catalog
            .register_volume(vol.id, vol.fs, vol.st_dev, &vol.desc, vol.size_cutoff)
            .map_err(to_io_error)?;
        let watermark = catalog.load_watermark(vol.id).map_err(to_io_error)?.unwrap_or_default();
        let mut vol = vol;
        vol.last_tracked_generation = watermark.last_tracked_generation;
        vol.last_tracked_size_cutoff = watermark.last_tracked_size_cutoff;

        root_handles.push(root);
        volumes.push(vol);
    }

    for vol in &volumes {
        scanner::scan(&catalog, &vol_ops, &progress, vol).map_err(to_io_error)?;
    }

    let checkpointer = Checkpointer::new(move || rusqlite::Connection::open(&catalog_path));
    let pipeline = DedupPipeline::new(volumes, &catalog, &vol_ops, &fingerprint, &progress);
    let stats = pipeline.run(&checkpointer, DEFAULT_WINDOW_SIZE).map_err(to_io_error)?;
    checkpointer.close();

    println!(
        "dedup pass complete: {} events, potential gains {}/{}/{} bytes",
        stats.events, stats.space_gain1, stats.space_gain2, stats.space_gain3
    );
    Ok(())
}

fn to_io_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
