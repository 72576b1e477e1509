use super::{fan_out_workers, tarfile, WorkloadError};
use crate::{
    completion::RunReport,
    context::RunContext,
    executors::{ExecutorError, Executors},
    extract::untar,
    layout::create_dirs,
    nodes::{NodeList, PairingStrategy},
    staging::{StagingArea, StagingTag},
};
use rand::Rng;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// deepest directory created by the create phase
pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum CrdelPhase {
    Create,
    Delete,
}

impl CrdelPhase {
    fn tag(self) -> StagingTag {
        match self {
            Self::Create => StagingTag::Create,
            Self::Delete => StagingTag::Delete,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CrossDeleteArgs {
    pub dirs: Vec<PathBuf>,
    pub nodes: NodeList,
    pub count: usize,
}

/// `<dir>/<node>_0/<node>_1/.../<node>_<depth - 1>`
pub fn nested_dir(dir: &Path, node: &str, depth: usize) -> PathBuf {
    (0..depth).fold(dir.to_path_buf(), |path, level| {
        path.join(format!("{node}_{level}"))
    })
}

/// one nested directory of random depth per mount point for every node
pub fn create_lists<R: Rng + ?Sized>(
    dirs: &[PathBuf],
    nodes: &NodeList,
    rng: &mut R,
) -> Vec<(String, Vec<PathBuf>)> {
    nodes
        .iter()
        .map(|node| {
            let paths = dirs
                .iter()
                .map(|dir| nested_dir(dir, node, rng.gen_range(1..=MAX_DEPTH)))
                .collect();

            (node.clone(), paths)
        })
        .collect()
}

/// every node removes the top level directories created by its partner
pub fn delete_lists(dirs: &[PathBuf], nodes: &NodeList) -> Vec<(String, Vec<PathBuf>)> {
    nodes
        .assignment(PairingStrategy::Inverted)
        .into_iter()
        .map(|(node, partner)| {
            let paths = dirs.iter().map(|dir| nested_dir(dir, partner, 1)).collect();

            (node.to_owned(), paths)
        })
        .collect()
}

/// Coordinator: in every iteration each node creates and populates a deep
/// directory per mount point, then deletes the directories of its partner.
/// Staging files are removed whatever the outcome.
#[instrument(skip_all, fields(nodes = %args.nodes, count = args.count))]
pub fn cross_delete<R: Rng + ?Sized>(
    ctx: &RunContext,
    executor: &mut Executors,
    args: &CrossDeleteArgs,
    rng: &mut R,
) -> Result<RunReport, WorkloadError> {
    args.nodes.require(2)?;

    let (nodes, dropped) = args.nodes.even();
    if let Some(dropped) = dropped {
        warn!(node = %dropped, "Odd number of nodes, {dropped} won't take part");
    }

    let tar = tarfile(ctx)?.to_path_buf();
    let stagedir = ctx
        .config
        .paths
        .stagedir
        .clone()
        .or_else(|| args.dirs.first().cloned())
        .ok_or(WorkloadError::Missing("test directory"))?;

    create_dirs(&args.dirs).map_err(|source| WorkloadError::Io {
        path: stagedir.clone(),
        source,
    })?;
    fs::create_dir_all(&stagedir).map_err(|source| WorkloadError::Io {
        path: stagedir.clone(),
        source,
    })?;

    let stage = StagingArea::new(stagedir);
    let result = iterate(ctx, executor, args, &nodes, &stage, &tar, rng);

    match stage.cleanup() {
        Ok(removed) => debug!(removed = removed, "Removed staging files"),
        Err(error) => warn!(error = %error, "Failed to clean up staging files"),
    }

    result
}

fn iterate<R: Rng + ?Sized>(
    ctx: &RunContext,
    executor: &mut Executors,
    args: &CrossDeleteArgs,
    nodes: &NodeList,
    stage: &StagingArea,
    tar: &Path,
    rng: &mut R,
) -> Result<RunReport, WorkloadError> {
    let mut report = RunReport::new("cross-delete", ctx.hostname.as_str());

    for iteration in 1..=args.count {
        info!("Starting iteration {iteration}/{}", args.count);

        for (node, paths) in create_lists(&args.dirs, nodes, rng) {
            stage.write(&node, StagingTag::Create, &paths)?;
        }
        for (node, paths) in delete_lists(&args.dirs, nodes) {
            stage.write(&node, StagingTag::Delete, &paths)?;
        }

        for phase in [CrdelPhase::Create, CrdelPhase::Delete] {
            let exec = ctx
                .worker_command("crdel-worker")
                .map_err(ExecutorError::SelfExe)?
                .arg("--phase")
                .arg(phase.as_str())
                .arg("--stage")
                .arg(stage.dir())
                .arg("--tarfile")
                .arg(tar);

            let run = fan_out_workers(ctx, executor, phase.as_str(), exec, nodes)?;
            let success = run.success();
            report.merge(run);

            if !success {
                error!(
                    "The {} phase of iteration {iteration} failed, skipping the remaining work",
                    phase.as_str()
                );

                return Ok(report);
            }
        }
    }

    Ok(report)
}

/// Worker: create and populate, or delete, the directories staged for this host.
/// Returns the number of directories handled.
#[instrument(skip_all, fields(host = %ctx.hostname, phase = phase.as_str()))]
pub fn crdel_worker(
    ctx: &RunContext,
    stage: &Path,
    phase: CrdelPhase,
    dirs: Option<Vec<PathBuf>>,
) -> Result<usize, WorkloadError> {
    let dirs = match dirs {
        Some(dirs) => dirs,
        None => StagingArea::new(stage).read(&ctx.hostname, phase.tag())?,
    };

    debug!(dirs = ?dirs, "Directories to handle");

    match phase {
        CrdelPhase::Create => {
            let tar = tarfile(ctx)?;

            for dir in dirs.iter() {
                fs::create_dir_all(dir).map_err(|source| WorkloadError::Io {
                    path: dir.clone(),
                    source,
                })?;
                untar(tar, dir, ctx.config.paths.logfile.as_deref())?;
            }
        }
        CrdelPhase::Delete => {
            for dir in dirs.iter() {
                match fs::remove_dir_all(dir) {
                    Ok(()) => info!(dir = ?dir, "Removed directory"),
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {
                        warn!(dir = ?dir, "Directory was already gone")
                    }
                    Err(source) => {
                        return Err(WorkloadError::Io {
                            path: dir.clone(),
                            source,
                        })
                    }
                }
            }
        }
    }

    Ok(dirs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::CommandSpec, config::HarnessConfig};
    use rand::{rngs::StdRng, SeedableRng};

    fn tarball(root: &Path) -> PathBuf {
        let src = root.join("src");
        fs::create_dir_all(src.join("linux")).unwrap();
        fs::write(src.join("linux/README"), "kernel").unwrap();

        let tarfile = root.join("linux.tar");
        let status = CommandSpec::new("tar")
            .arg("-cf")
            .arg(&tarfile)
            .arg("-C")
            .arg(&src)
            .arg("linux")
            .status()
            .unwrap();
        assert!(status.success());

        tarfile
    }

    #[test]
    fn nesting() {
        assert_eq!(
            nested_dir(Path::new("/mnt/a"), "n1", 3),
            PathBuf::from("/mnt/a/n1_0/n1_1/n1_2")
        );
        assert_eq!(nested_dir(Path::new("/mnt/a"), "n1", 1), PathBuf::from("/mnt/a/n1_0"));
    }

    #[test]
    fn create_lists_stay_within_depth() {
        let dirs = vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")];
        let nodes: NodeList = "n0,n1".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            for (node, paths) in create_lists(&dirs, &nodes, &mut rng) {
                assert_eq!(paths.len(), 2);

                for (dir, path) in dirs.iter().zip(paths.iter()) {
                    let depth = path.strip_prefix(dir).unwrap().components().count();

                    assert!((1..=MAX_DEPTH).contains(&depth));
                    assert!(path.starts_with(dir.join(format!("{node}_0"))));
                }
            }
        }
    }

    #[test]
    fn delete_lists_swap_pairs() {
        let dirs = vec![PathBuf::from("/mnt/a")];
        let nodes: NodeList = "a,b,c,d".parse().unwrap();

        assert_eq!(
            delete_lists(&dirs, &nodes),
            vec![
                ("a".to_owned(), vec![PathBuf::from("/mnt/a/b_0")]),
                ("b".to_owned(), vec![PathBuf::from("/mnt/a/a_0")]),
                ("c".to_owned(), vec![PathBuf::from("/mnt/a/d_0")]),
                ("d".to_owned(), vec![PathBuf::from("/mnt/a/c_0")]),
            ]
        );
    }

    #[test]
    fn worker_phases() {
        let root = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.kernel.tarfile = Some(tarball(root.path()));
        let ctx = RunContext::new(config, "n1");

        let stage = StagingArea::new(root.path());
        let created = nested_dir(&root.path().join("mnt"), "n1", 5);
        stage
            .write("n1", StagingTag::Create, &[created.clone()])
            .unwrap();
        stage
            .write("n1", StagingTag::Delete, &[nested_dir(&root.path().join("mnt"), "n1", 1)])
            .unwrap();

        assert_eq!(crdel_worker(&ctx, root.path(), CrdelPhase::Create, None).unwrap(), 1);
        assert!(created.join("linux/README").is_file());

        assert_eq!(crdel_worker(&ctx, root.path(), CrdelPhase::Delete, None).unwrap(), 1);
        assert!(!root.path().join("mnt/n1_0").exists());
        assert!(root.path().join("mnt").is_dir());
    }

    #[test]
    fn coordinator_cleans_up_staging() {
        let root = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.kernel.tarfile = Some(tarball(root.path()));
        config.launcher.self_exe = Some(PathBuf::from("true"));
        let ctx = RunContext::new(config, "n0");

        let args = CrossDeleteArgs {
            dirs: vec![root.path().join("a")],
            nodes: "n0,n1,n2".parse().unwrap(),
            count: 2,
        };

        let report = cross_delete(
            &ctx,
            &mut Executors::local(),
            &args,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();

        // n2 is dropped, one worker per remaining node and phase, two phases per iteration
        assert!(report.success());
        assert_eq!(report.outcomes.len(), 2 * 2 * 2);

        let leftovers = fs::read_dir(root.path().join("a"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().map_or(false, |ext| ext == "dat"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn coordinator_needs_two_nodes() {
        let root = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(HarnessConfig::default(), "n0");
        let args = CrossDeleteArgs {
            dirs: vec![root.path().to_path_buf()],
            nodes: "n0".parse().unwrap(),
            count: 1,
        };

        assert!(matches!(
            cross_delete(&ctx, &mut Executors::local(), &args, &mut rand::thread_rng()),
            Err(WorkloadError::Node(_))
        ));
    }
}
