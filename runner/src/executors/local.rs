use super::{spawn_all, Executor, ExecutorError, Job};
use crate::{command::CommandSpec, completion::Worker};
use tracing::{debug, instrument};

/// Executor that spawns every process on this host
#[derive(Clone, Debug, Default)]
pub struct LocalExecutor {}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {}
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    /// One process per slot for local jobs. Cluster jobs of worker subcommands
    /// get one process per node acting as that node, any other cluster job
    /// `nproc` copies of the command.
    #[instrument(skip(self, job), level = "debug")]
    fn launch(&mut self, job: &Job) -> Result<Vec<Worker>, ExecutorError> {
        match job {
            Job::Local(jobs) => {
                debug!("Spawning {} local slots", jobs.len());

                spawn_all(jobs.iter().map(|job| (job.label.clone(), &job.exec)))
            }
            Job::Cluster(cluster) if cluster.node_hostname => {
                let commands: Vec<(String, CommandSpec)> = cluster
                    .nodes
                    .iter()
                    .map(|node| (node.clone(), cluster.exec_as(node)))
                    .collect();

                debug!("Spawning one local worker per node of {}", cluster.nodes);

                spawn_all(commands.iter().map(|(node, spec)| (node.clone(), spec)))
            }
            Job::Cluster(cluster) => {
                let nproc = cluster.nproc.max(1);
                debug!(
                    "Spawning {nproc} local copies in place of nodes {}",
                    cluster.nodes
                );

                spawn_all((0..nproc).map(|copy| (format!("local#{copy}"), &cluster.exec)))
            }
        }
    }
}
