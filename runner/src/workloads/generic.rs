use super::{fan_out, log_dir, WorkloadError};
use crate::{
    command::CommandSpec, completion::RunReport, context::RunContext, executors::Executors,
    nodes::NodeList,
};
use std::{ffi::OsString, fs, path::PathBuf};
use tracing::instrument;

/// Any workload binary started on every node
#[derive(Clone, Debug)]
pub struct RunArgs {
    pub name: String,
    pub nodes: NodeList,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// defaults to `<logdir>/<name>_<host>.log`
    pub log: Option<PathBuf>,
}

#[instrument(skip_all, fields(name = %args.name, nodes = %args.nodes))]
pub fn run(
    ctx: &RunContext,
    executor: &mut Executors,
    args: &RunArgs,
) -> Result<RunReport, WorkloadError> {
    let log = match args.log {
        Some(ref log) => log.clone(),
        None => {
            let logs = log_dir(ctx);
            fs::create_dir_all(&logs).map_err(|source| WorkloadError::Io {
                path: logs.clone(),
                source,
            })?;

            logs.join(format!("{}_{}.log", args.name, ctx.hostname))
        }
    };

    let mut exec = CommandSpec::new(&args.program)
        .args(&args.args)
        .log_to(log);
    if let Some(ref cwd) = args.cwd {
        exec = exec.current_dir(cwd);
    }

    fan_out(ctx, executor, &args.name, exec, &args.nodes)
}
