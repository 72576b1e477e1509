mod local;
mod mpi;
mod ssh;

pub use local::LocalExecutor;
pub use mpi::MpiExecutor;
pub use ssh::SshExecutor;

use crate::{
    command::CommandSpec,
    completion::{wait_all, RunReport, WaitEvent, WaitOptions, Worker},
    config::{Backend, HarnessConfig, LaunchMode},
    context::RunContext,
    nodes::NodeList,
};
use std::{io, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write host file {path:?}: {source}")]
    HostFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("The {backend} executor can't run {job} jobs")]
    Unsupported {
        backend: &'static str,
        job: &'static str,
    },
    #[error("Failed to locate the worker binary: {0}")]
    SelfExe(io::Error),
}

/// One command for one local slot
#[derive(Clone, Debug)]
pub struct SingleJob {
    pub label: String,
    pub exec: CommandSpec,
}

/// The same command on every node of a node list
#[derive(Clone, Debug)]
pub struct ClusterJob {
    pub exec: CommandSpec,
    pub nodes: NodeList,
    pub nproc: usize,
    /// the command is a worker subcommand of this binary that needs to be
    /// told which node it acts as when it does not run on that node
    pub node_hostname: bool,
}

impl ClusterJob {
    pub fn new(exec: CommandSpec, nodes: NodeList, nproc: usize) -> Self {
        Self {
            exec,
            nodes,
            nproc,
            node_hostname: false,
        }
    }

    pub fn with_node_hostname(mut self) -> Self {
        self.node_hostname = true;
        self
    }

    /// `exec` acting as `node`
    pub fn exec_as(&self, node: &str) -> CommandSpec {
        self.exec.clone().arg("--hostname").arg(node)
    }
}

#[derive(Clone, Debug)]
pub enum Job {
    Local(Vec<SingleJob>),
    Cluster(ClusterJob),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Cluster(_) => "cluster",
        }
    }
}

/// A backend able to start the processes of a job
pub trait Executor {
    fn name(&self) -> &'static str;

    /// start every process of `job` without waiting for them
    fn launch(&mut self, job: &Job) -> Result<Vec<Worker>, ExecutorError>;
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(LocalExecutor),
    Ssh(SshExecutor),
    Mpi(MpiExecutor),
}

impl Executors {
    pub fn load(config: &HarnessConfig) -> Self {
        match config.launcher.backend {
            Backend::Local => Self::Local(LocalExecutor::new()),
            Backend::Ssh => Self::Ssh(SshExecutor::load(&config.launcher)),
            Backend::Mpi => Self::Mpi(MpiExecutor::load(&config.launcher)),
        }
    }

    pub fn local() -> Self {
        Self::Local(LocalExecutor::new())
    }

    fn inner(&mut self) -> &mut dyn Executor {
        match self {
            Self::Local(executor) => executor,
            Self::Ssh(executor) => executor,
            Self::Mpi(executor) => executor,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(executor) => executor.name(),
            Self::Ssh(executor) => executor.name(),
            Self::Mpi(executor) => executor.name(),
        }
    }

    pub fn launch(&mut self, job: &Job) -> Result<Vec<Worker>, ExecutorError> {
        self.inner().launch(job)
    }

    /// Launch `job` and, in `Wait` mode, block until every process exited.
    /// In `NoWait` mode the processes keep running and only their pids are reported.
    #[instrument(skip(self, ctx, job, options), fields(executor = self.name()))]
    pub fn execute(
        &mut self,
        ctx: &RunContext,
        name: &str,
        job: &Job,
        mode: LaunchMode,
        options: &WaitOptions,
    ) -> Result<RunReport, ExecutorError> {
        let workers = self.launch(job)?;
        let mut report = RunReport::new(name, ctx.hostname.clone());

        match mode {
            LaunchMode::Wait => {
                report.outcomes = wait_all(workers, options, &ctx.cancel, |event| {
                    if let WaitEvent::Status(pending) = event {
                        info!(
                            pending = pending.len(),
                            "Waiting on {}",
                            pending.labels().collect::<Vec<_>>().join(", ")
                        );
                    }
                });
            }
            LaunchMode::NoWait => {
                report.detached = workers.into_iter().map(Worker::detach).collect();
                debug!(pids = ?report.detached, "Left workers running");
            }
        }

        ctx.record(&report);

        Ok(report)
    }
}

/// Spawn every (label, command) pair, killing the already started ones if a spawn fails
pub(crate) fn spawn_all<'a, I>(commands: I) -> Result<Vec<Worker>, ExecutorError>
where
    I: IntoIterator<Item = (String, &'a CommandSpec)>,
{
    let mut workers = Vec::new();

    for (slot, (label, spec)) in commands.into_iter().enumerate() {
        match Worker::spawn(slot, label, spec) {
            Ok(worker) => workers.push(worker),
            Err(source) => {
                workers.into_iter().for_each(Worker::abort);

                return Err(ExecutorError::Spawn {
                    program: spec.program().to_string_lossy().into_owned(),
                    source,
                });
            }
        }
    }

    Ok(workers)
}
