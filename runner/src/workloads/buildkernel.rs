use super::{fan_out_workers, join_dirs, log_dir, run_step, tarfile, WorkloadError};
use crate::{
    command::CommandSpec,
    completion::RunReport,
    config::LaunchMode,
    context::RunContext,
    executors::{ExecutorError, Executors, Job, SingleJob},
    extract::{prepare_trees, TreeError},
    layout::{kernel_dir, node_dir},
    nodes::{NodeList, PairingStrategy},
};
use std::{fs, path::PathBuf};
use tracing::{error, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct BuildArgs {
    pub dirs: Vec<PathBuf>,
    pub nodes: NodeList,
    /// number of iterations
    pub count: usize,
}

/// Coordinator: make sure every node tree is complete, then run `build-worker`
/// on every node `count` times. The first failed iteration stops the loop.
/// With inverted pairing an odd trailing node is left out.
#[instrument(skip_all, fields(nodes = %args.nodes, count = args.count))]
pub fn build_kernel(
    ctx: &RunContext,
    executor: &mut Executors,
    args: &BuildArgs,
) -> Result<RunReport, WorkloadError> {
    args.nodes.require(1)?;
    if args.dirs.is_empty() {
        return Err(WorkloadError::Missing("test directory"));
    }

    let nodes = match ctx.config.pairing {
        PairingStrategy::Previous => args.nodes.clone(),
        PairingStrategy::Inverted => {
            let (nodes, dropped) = args.nodes.even();
            if let Some(dropped) = dropped {
                warn!(node = %dropped, "Odd number of nodes, {dropped} won't take part");
            }

            nodes.require(2)?;
            nodes
        }
    };

    prepare_trees(ctx, tarfile(ctx)?, &args.dirs, &nodes, false)?;

    let exec = ctx
        .worker_command("build-worker")
        .map_err(ExecutorError::SelfExe)?
        .arg("--dirs")
        .arg(join_dirs(&args.dirs))
        .arg("--nodes")
        .arg(nodes.to_string());

    let mut report = RunReport::new("buildkernel", ctx.hostname.as_str());

    for iteration in 1..=args.count {
        info!("Starting iteration {iteration}/{}", args.count);

        let run = fan_out_workers(ctx, executor, "buildkernel", exec.clone(), &nodes)?;
        let success = run.success();
        report.merge(run);

        if !success {
            error!("Iteration {iteration} failed, skipping the remaining ones");
            break;
        }
    }

    Ok(report)
}

/// Worker: build the own kernel tree in every directory while listing the
/// tree of the partner node.
///
/// Slot `x` builds in `<dir x>/<host>/<kernel>`, slot `x + dirs` runs
/// `find . -print` in `<dir x>/<partner>`.
#[instrument(skip_all, fields(host = %ctx.hostname))]
pub fn build_worker(
    ctx: &RunContext,
    dirs: &[PathBuf],
    nodes: &NodeList,
) -> Result<RunReport, WorkloadError> {
    let host = ctx.hostname.as_str();
    let partner = nodes.partner_under(host, ctx.config.pairing)?;
    let kernel = ctx.config.kernel.dir_name.as_str();
    let make = &ctx.config.kernel.make;

    let logs = log_dir(ctx);
    fs::create_dir_all(&logs).map_err(|source| WorkloadError::Io {
        path: logs.clone(),
        source,
    })?;

    info!(partner = partner, "Listing the tree of {partner} while building");

    let mut builds = Vec::with_capacity(dirs.len());
    let mut finds = Vec::with_capacity(dirs.len());

    for (x, dir) in dirs.iter().enumerate() {
        let own = kernel_dir(dir, host, kernel);
        if !own.is_dir() {
            return Err(TreeError::NotADirectory(own).into());
        }

        let build_log = logs.join(format!("build_{host}_{x}.log"));
        let find_log = logs.join(format!("find_{host}_{x}.log"));

        // a custom .config survives mrproper only if copied back in afterwards
        run_step(&CommandSpec::new(make).arg("mrproper").current_dir(&own).log_to(&build_log))?;
        match ctx.config.kernel.config_file {
            Some(ref config_file) => {
                let target = own.join(".config");
                fs::copy(config_file, &target).map_err(|source| WorkloadError::Io {
                    path: target,
                    source,
                })?;
                run_step(
                    &CommandSpec::new(make)
                        .arg("olddefconfig")
                        .current_dir(&own)
                        .log_to(&build_log),
                )?;
            }
            None => run_step(
                &CommandSpec::new(make)
                    .arg("defconfig")
                    .current_dir(&own)
                    .log_to(&build_log),
            )?,
        }

        builds.push(SingleJob {
            label: format!("build {}", own.display()),
            exec: CommandSpec::new(make)
                .args(["-j2", "V=1"])
                .current_dir(&own)
                .log_to(build_log),
        });

        let other = node_dir(dir, partner);
        finds.push(SingleJob {
            label: format!("find {}", other.display()),
            exec: CommandSpec::new("find")
                .args([".", "-print"])
                .current_dir(other)
                .log_to(find_log),
        });
    }

    builds.extend(finds);

    Ok(Executors::local().execute(
        ctx,
        "build-worker",
        &Job::Local(builds),
        LaunchMode::Wait,
        &ctx.config.wait.options(),
    )?)
}
