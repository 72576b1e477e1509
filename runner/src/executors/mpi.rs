use super::{spawn_all, ClusterJob, Executor, ExecutorError, Job};
use crate::{
    command::CommandSpec,
    completion::Worker,
    config::LauncherConfig,
    nodes::NodeList,
};
use itertools::Itertools;
use std::{fs, path::Path};
use tracing::{debug, info, instrument};

/// Executor handing the whole node list to a single `mpirun` invocation.
///
/// Only the aggregate status of `mpirun` is observed, it fails if any rank failed.
#[derive(Clone, Debug)]
pub struct MpiExecutor {
    config: LauncherConfig,
}

impl MpiExecutor {
    pub fn load(config: &LauncherConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn hostfile(&self) -> &Path {
        &self.config.hostfile
    }

    /// write one node per line, replacing an older host file
    pub fn write_hostfile(&self, nodes: &NodeList) -> Result<(), ExecutorError> {
        let content = nodes.iter().map(|node| format!("{node}\n")).join("");

        let hostfile = self.hostfile();
        let host_error = |source| ExecutorError::HostFile {
            path: hostfile.to_path_buf(),
            source,
        };

        if let Some(parent) = hostfile.parent() {
            fs::create_dir_all(parent).map_err(host_error)?;
        }
        fs::write(hostfile, content).map_err(host_error)?;

        debug!(hostfile = ?hostfile, nodes = %nodes, "Wrote MPI host file");

        Ok(())
    }

    /// `mpirun` argument vector running `job.exec` once per node
    pub fn command(&self, job: &ClusterJob) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.mpirun)
            .arg("--hostfile")
            .arg(self.hostfile())
            .arg("-np")
            .arg(job.nproc.max(job.nodes.len()).to_string())
            .args(["--map-by", "node"])
            .args(["--mca", "plm_rsh_agent", self.config.remote_shell.program()]);

        if let Some(ref interface) = self.config.interface {
            spec = spec.args(["--mca", "btl_tcp_if_include", interface.as_str()]);
        }

        spec = spec
            .opt_arg("-wdir", job.exec.cwd())
            .args(&self.config.extra_args)
            .args(job.exec.argv());

        match job.exec.log() {
            Some(log) => spec.log_to(log),
            None => spec,
        }
    }
}

impl Executor for MpiExecutor {
    fn name(&self) -> &'static str {
        "mpi"
    }

    #[instrument(skip(self, job), level = "debug")]
    fn launch(&mut self, job: &Job) -> Result<Vec<Worker>, ExecutorError> {
        match job {
            Job::Cluster(cluster) => {
                self.write_hostfile(&cluster.nodes)?;

                let spec = self.command(cluster);
                info!(command = %spec, "Starting mpirun");

                spawn_all([("mpirun".to_owned(), &spec)])
            }
            other => Err(ExecutorError::Unsupported {
                backend: self.name(),
                job: other.kind(),
            }),
        }
    }
}
