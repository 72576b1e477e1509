use crate::{
    command::CommandSpec,
    context::RunContext,
    layout::{clear_node_dirs, create_dirs, node_dir, node_dirs},
    nodes::NodeList,
    staleness,
};
use itertools::iproduct;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::ExitStatus,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Tar file {0:?} not found")]
    TarMissing(PathBuf),
    #[error("`{command}` failed with {status}")]
    CommandFailed { command: String, status: ExitStatus },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} is not a directory, can't extract into it")]
    NotADirectory(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> TreeError + '_ {
    move |source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What `prepare_trees` ended up doing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preparation {
    Reused,
    Reinitialized,
}

/// extract `tarfile` into the existing directory `dest`
pub fn untar(tarfile: &Path, dest: &Path, log: Option<&Path>) -> Result<(), TreeError> {
    if !tarfile.is_file() {
        return Err(TreeError::TarMissing(tarfile.to_path_buf()));
    }
    if !dest.is_dir() {
        return Err(TreeError::NotADirectory(dest.to_path_buf()));
    }

    let mut spec = CommandSpec::new("tar")
        .arg("-xf")
        .arg(tarfile)
        .arg("-C")
        .arg(dest);

    if let Some(log) = log {
        spec = spec.log_to(log);
    }

    info!(tarfile = ?tarfile, dest = ?dest, "Extracting tar file");
    let status = spec.status().map_err(io_error(dest))?;

    if status.success() {
        Ok(())
    } else {
        Err(TreeError::CommandFailed {
            command: spec.to_string(),
            status,
        })
    }
}

/// Create `dest`, extract the tarball into it and drop in the kernel `.config`
pub fn extract_tree(ctx: &RunContext, tarfile: &Path, dest: &Path) -> Result<(), TreeError> {
    fs::create_dir_all(dest).map_err(io_error(dest))?;
    untar(tarfile, dest, ctx.config.paths.logfile.as_deref())?;

    if let Some(ref config_file) = ctx.config.kernel.config_file {
        let target = dest.join(&ctx.config.kernel.dir_name).join(".config");

        debug!(source = ?config_file, target = ?target, "Copying kernel config");
        fs::copy(config_file, &target).map_err(io_error(&target))?;
    }

    Ok(())
}

/// Extract into every `<dir>/<node>` that doesn't exist yet, returns the number of new trees
#[instrument(skip(ctx, dirs, nodes))]
pub fn extract_all(
    ctx: &RunContext,
    tarfile: &Path,
    dirs: &[PathBuf],
    nodes: &NodeList,
) -> Result<usize, TreeError> {
    if !tarfile.is_file() {
        return Err(TreeError::TarMissing(tarfile.to_path_buf()));
    }

    create_dirs(dirs).map_err(|source| TreeError::Io {
        path: dirs.first().cloned().unwrap_or_default(),
        source,
    })?;

    let mut extracted = 0;

    for (dir, node) in iproduct!(dirs.iter(), nodes.iter()) {
        let dest = node_dir(dir, node);

        if dest.exists() {
            info!(dest = ?dest, "Directory already exists, skipping");
            continue;
        }

        extract_tree(ctx, tarfile, &dest)?;
        extracted += 1;
    }

    Ok(extracted)
}

/// Reuse the node trees if none of them is smaller than the tarball content,
/// otherwise clear and re-extract all of them.
#[instrument(skip(ctx, dirs, nodes))]
pub fn prepare_trees(
    ctx: &RunContext,
    tarfile: &Path,
    dirs: &[PathBuf],
    nodes: &NodeList,
    force: bool,
) -> Result<Preparation, TreeError> {
    let clear = |reason: &str| -> Result<Preparation, TreeError> {
        warn!("Reinitializing every node tree: {reason}");

        clear_node_dirs(dirs, nodes).map_err(|source| TreeError::Io {
            path: dirs.first().cloned().unwrap_or_default(),
            source,
        })?;
        extract_all(ctx, tarfile, dirs, nodes)?;

        Ok(Preparation::Reinitialized)
    };

    if force || ctx.config.cleanup_before_run {
        return clear("cleanup requested");
    }

    let expected = staleness::expected_size(tarfile)?;
    let staleness = staleness::check(expected, &node_dirs(dirs, nodes));

    if staleness.is_stale() {
        clear(&format!(
            "{} of {} trees are below {} bytes",
            staleness.stale.len(),
            dirs.len() * nodes.len(),
            expected
        ))
    } else {
        info!(expected = expected, "All node trees are complete, reusing them");

        Ok(Preparation::Reused)
    }
}
