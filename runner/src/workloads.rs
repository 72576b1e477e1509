mod buildkernel;
mod cross_delete;
mod generic;

pub use buildkernel::{build_kernel, build_worker, BuildArgs};
pub use cross_delete::{
    crdel_worker, create_lists, cross_delete, delete_lists, nested_dir, CrdelPhase,
    CrossDeleteArgs, MAX_DEPTH,
};
pub use generic::{run, RunArgs};

use crate::{
    command::CommandSpec,
    completion::RunReport,
    config::ConfigErrors,
    context::RunContext,
    database::ConnectionError,
    executors::{ClusterJob, ExecutorError, Executors, Job},
    extract::TreeError,
    nodes::{NodeError, NodeList},
    staging::StagingError,
};
use std::{
    env, io,
    path::{Path, PathBuf},
    process::ExitStatus,
};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed with {status}")]
    CommandFailed { command: String, status: ExitStatus },
    #[error("No {0} given")]
    Missing(&'static str),
}

/// tar file from the command line or the config
pub fn tarfile(ctx: &RunContext) -> Result<&Path, WorkloadError> {
    ctx.config
        .kernel
        .tarfile
        .as_deref()
        .ok_or(WorkloadError::Missing("kernel tarball"))
}

/// Directory receiving per worker logs: next to the shared log file, or the temp dir
pub fn log_dir(ctx: &RunContext) -> PathBuf {
    ctx.config
        .paths
        .logfile
        .as_deref()
        .and_then(Path::parent)
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(env::temp_dir)
}

/// run a step synchronously, a non zero exit is an error
pub(crate) fn run_step(spec: &CommandSpec) -> Result<(), WorkloadError> {
    let status = spec.status().map_err(|source| WorkloadError::Io {
        path: spec.cwd().map(Path::to_path_buf).unwrap_or_default(),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(WorkloadError::CommandFailed {
            command: spec.to_string(),
            status,
        })
    }
}

/// Fan `exec` out across `nodes` with the configured launcher and wait mode
pub fn fan_out(
    ctx: &RunContext,
    executor: &mut Executors,
    name: &str,
    exec: CommandSpec,
    nodes: &NodeList,
) -> Result<RunReport, WorkloadError> {
    let job = ClusterJob::new(exec, nodes.clone(), ctx.config.nproc_for(nodes.len()));

    launch(ctx, executor, name, job)
}

/// Fan a worker subcommand of this binary out across `nodes`, every copy acts as its node
pub(crate) fn fan_out_workers(
    ctx: &RunContext,
    executor: &mut Executors,
    name: &str,
    exec: CommandSpec,
    nodes: &NodeList,
) -> Result<RunReport, WorkloadError> {
    let job = ClusterJob::new(exec, nodes.clone(), ctx.config.nproc_for(nodes.len()))
        .with_node_hostname();

    launch(ctx, executor, name, job)
}

fn launch(
    ctx: &RunContext,
    executor: &mut Executors,
    name: &str,
    job: ClusterJob,
) -> Result<RunReport, WorkloadError> {
    info!(name = name, nodes = %job.nodes, "Fanning out");

    Ok(executor.execute(
        ctx,
        name,
        &Job::Cluster(job),
        ctx.config.launcher.mode,
        &ctx.config.wait.options(),
    )?)
}

/// join paths for a comma separated command line flag
pub(crate) fn join_dirs(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|dir| dir.to_string_lossy())
        .collect::<Vec<_>>()
        .join(",")
}
