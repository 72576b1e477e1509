use super::{spawn_all, Executor, ExecutorError, Job};
use crate::{
    command::CommandSpec,
    completion::Worker,
    config::{LauncherConfig, RemoteShell},
};
use tracing::{debug, instrument};

/// Executor running one remote shell invocation per node, which keeps an
/// exit status for every node
#[derive(Clone, Debug)]
pub struct SshExecutor {
    shell: RemoteShell,
    extra_args: Vec<String>,
}

impl SshExecutor {
    pub fn load(config: &LauncherConfig) -> Self {
        Self {
            shell: config.remote_shell,
            extra_args: config.extra_args.clone(),
        }
    }

    /// remote invocation of `exec` on `node`, output is collected locally
    pub fn command(&self, node: &str, exec: &CommandSpec) -> CommandSpec {
        let mut spec = CommandSpec::new(self.shell.program());

        if self.shell == RemoteShell::Ssh {
            spec = spec.args(["-o", "BatchMode=yes"]);
        }

        spec = spec
            .args(&self.extra_args)
            .arg(node)
            .arg(exec.shell_line());

        match exec.log() {
            Some(log) => spec.log_to(log),
            None => spec,
        }
    }
}

impl Executor for SshExecutor {
    fn name(&self) -> &'static str {
        "ssh"
    }

    #[instrument(skip(self, job), level = "debug")]
    fn launch(&mut self, job: &Job) -> Result<Vec<Worker>, ExecutorError> {
        match job {
            Job::Cluster(cluster) => {
                let commands: Vec<(String, CommandSpec)> = cluster
                    .nodes
                    .iter()
                    .map(|node| (node.clone(), self.command(node, &cluster.exec)))
                    .collect();

                debug!("Starting {} remote shells", commands.len());

                spawn_all(commands.iter().map(|(node, spec)| (node.clone(), spec)))
            }
            other => Err(ExecutorError::Unsupported {
                backend: self.name(),
                job: other.kind(),
            }),
        }
    }
}
