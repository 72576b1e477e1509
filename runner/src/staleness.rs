use crate::{command::CommandSpec, extract::TreeError};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::{
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// du reports usage in 512 byte blocks
const BLOCK_SIZE: u64 = 512;

/// Sum of the entry sizes in a `tar -tv` listing (GNU layout, size is the third column).
/// Lines without a numeric size, e.g. device nodes, are skipped.
pub fn parse_listing(listing: &str) -> u64 {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .filter_map(|size| size.parse::<u64>().ok())
        .sum()
}

/// uncompressed size of every entry of `tarfile`
#[instrument(level = "debug")]
pub fn expected_size(tarfile: &Path) -> Result<u64, TreeError> {
    if !tarfile.is_file() {
        return Err(TreeError::TarMissing(tarfile.to_path_buf()));
    }

    let spec = CommandSpec::new("tar").arg("-tvf").arg(tarfile);
    let output = spec
        .to_command()
        .and_then(|mut command| command.output())
        .map_err(|source| TreeError::Io {
            path: tarfile.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(TreeError::CommandFailed {
            command: spec.to_string(),
            status: output.status,
        });
    }

    let size = parse_listing(&String::from_utf8_lossy(&output.stdout));
    debug!(tarfile = ?tarfile, size = size, "Computed expected tree size");

    Ok(size)
}

/// Allocated size of everything below `path`, 0 if it doesn't exist
pub fn disk_usage(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }

    WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = %error, "Failed to walk tree for disk usage");
                None
            }
        })
        .filter_map(|entry| entry.path().symlink_metadata().ok())
        .map(|metadata| metadata.blocks() * BLOCK_SIZE)
        .sum()
}

/// Outcome of comparing the node trees against the expected size
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Staleness {
    pub expected: u64,
    /// trees below the expected size with their actual usage
    pub stale: Vec<(PathBuf, u64)>,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !self.stale.is_empty()
    }
}

/// every tree whose usage is below `expected`
pub fn find_stale(expected: u64, usage: &[(PathBuf, u64)]) -> Staleness {
    Staleness {
        expected,
        stale: usage
            .iter()
            .filter(|(_, actual)| *actual < expected)
            .cloned()
            .collect(),
    }
}

/// measure every tree in parallel and compare it against `expected`
#[instrument(skip(trees), level = "debug")]
pub fn check(expected: u64, trees: &[PathBuf]) -> Staleness {
    let usage: Vec<(PathBuf, u64)> = trees
        .par_iter()
        .map(|tree| (tree.clone(), disk_usage(tree)))
        .collect();

    let staleness = find_stale(expected, &usage);

    for (tree, actual) in staleness.stale.iter() {
        info!(tree = ?tree, actual = actual, expected = expected, "Tree is smaller than expected");
    }

    staleness
}
