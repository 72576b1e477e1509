use cfs_runner::{
    completion::{CancelToken, RunReport},
    config::{Backend, DatabaseConfig, HarnessConfig},
    context::{local_hostname, RunContext},
    database::StorageAdapters,
    executors::Executors,
    extract::prepare_trees,
    layout::{clear_node_dirs, parse_dirs},
    logging,
    nodes::NodeList,
    workloads::{self, BuildArgs, CrdelPhase, CrossDeleteArgs, RunArgs, WorkloadError},
};
use clap::{Args, Parser, Subcommand};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::{
    ffi::OsString,
    fs::File,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, info_span, warn};

/// Distributed test driver for cluster filesystems
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML harness configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Shared log file, per worker logs are written next to it
    #[arg(short, long, global = true)]
    logfile: Option<PathBuf>,
    #[arg(short = 'D', long, global = true)]
    debug: bool,
    /// Write the run report as YAML
    #[arg(long, global = true)]
    report: Option<PathBuf>,
    /// SQLite database receiving every run report
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,
    /// Act as this host instead of the local hostname
    #[arg(long, global = true)]
    hostname: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Targets {
    /// Comma separated list of test directories
    #[arg(short, long)]
    dirs: String,
    /// Comma separated list of nodes
    #[arg(short, long)]
    nodes: NodeList,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the kernel tree for every node, reinitializing stale trees
    Extract {
        #[command(flatten)]
        targets: Targets,
        #[arg(short, long)]
        tarfile: Option<PathBuf>,
        /// Clear and extract even if every tree is complete
        #[arg(long)]
        force: bool,
    },
    /// Remove the tree of every node
    Clear {
        #[command(flatten)]
        targets: Targets,
    },
    /// Build the kernel on every node while another node lists the tree
    Buildkernel {
        #[command(flatten)]
        targets: Targets,
        #[arg(short, long)]
        tarfile: Option<PathBuf>,
        /// Number of iterations
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        /// Network interface for launcher traffic
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// Node side of buildkernel
    BuildWorker {
        #[command(flatten)]
        targets: Targets,
    },
    /// Create deep directories on every node and delete them from its partner
    CrossDelete {
        #[command(flatten)]
        targets: Targets,
        #[arg(short, long)]
        tarfile: Option<PathBuf>,
        #[arg(short, long, default_value_t = 1)]
        count: usize,
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// Node side of cross-delete
    CrdelWorker {
        #[arg(long, value_enum)]
        phase: CrdelPhase,
        /// Directory holding the staging files
        #[arg(short, long)]
        stage: PathBuf,
        #[arg(short, long)]
        tarfile: Option<PathBuf>,
        /// Use these directories instead of the staging file
        #[arg(short, long)]
        dirs: Option<String>,
    },
    /// Start any workload binary on every node
    Run {
        #[arg(short, long)]
        nodes: NodeList,
        /// Name used for logs and reports, defaults to the program name
        #[arg(long)]
        name: Option<String>,
        #[arg(short = 'C', long)]
        cwd: Option<PathBuf>,
        /// Log file of the workers
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(short, long)]
        interface: Option<String>,
        program: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Extract { .. } => "extract",
            Self::Clear { .. } => "clear",
            Self::Buildkernel { .. } => "buildkernel",
            Self::BuildWorker { .. } => "build-worker",
            Self::CrossDelete { .. } => "cross-delete",
            Self::CrdelWorker { .. } => "crdel-worker",
            Self::Run { .. } => "run",
        }
    }

    /// (launches through the configured launcher, needs the kernel tarball)
    fn requirements(&self) -> Option<(bool, bool)> {
        match self {
            Self::Extract { .. } => Some((false, true)),
            Self::Buildkernel { .. } | Self::CrossDelete { .. } => Some((true, true)),
            Self::Run { .. } => Some((true, false)),
            Self::Clear { .. } | Self::BuildWorker { .. } | Self::CrdelWorker { .. } => None,
        }
    }

    /// fold the command line overrides into the loaded config
    fn apply(&self, config: &mut HarnessConfig) {
        let (tarfile, interface) = match self {
            Self::Extract { tarfile, .. } | Self::CrdelWorker { tarfile, .. } => (tarfile, &None),
            Self::Buildkernel {
                tarfile, interface, ..
            }
            | Self::CrossDelete {
                tarfile, interface, ..
            } => (tarfile, interface),
            Self::Run { interface, .. } => (&None, interface),
            Self::Clear { .. } | Self::BuildWorker { .. } => (&None, &None),
        };

        if let Some(tarfile) = tarfile {
            config.kernel.tarfile = Some(tarfile.clone());
        }
        if let Some(interface) = interface {
            config.launcher.interface = Some(interface.clone());
        }
    }
}

static CANCEL: OnceCell<CancelToken> = OnceCell::new();

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    if let Some(cancel) = CANCEL.get() {
        cancel.cancel();
    }
}

/// SIGINT and SIGTERM kill the pending workers instead of the coordinator
fn install_interrupt_handler(cancel: &CancelToken) -> nix::Result<()> {
    let _ = CANCEL.set(cancel.clone());
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );

    // the handler only stores into an atomic flag
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }

    Ok(())
}

fn dispatch(ctx: &RunContext, command: Command) -> Result<Option<RunReport>, WorkloadError> {
    let mut executor = Executors::load(&ctx.config);

    match command {
        Command::Extract { targets, force, .. } => {
            let dirs = parse_dirs(&targets.dirs);
            let preparation = prepare_trees(
                ctx,
                workloads::tarfile(ctx)?,
                &dirs,
                &targets.nodes,
                force,
            )?;
            info!(preparation = ?preparation, "Node trees are ready");

            Ok(None)
        }
        Command::Clear { targets } => {
            let dirs = parse_dirs(&targets.dirs);
            clear_node_dirs(&dirs, &targets.nodes).map_err(|source| WorkloadError::Io {
                path: dirs.first().cloned().unwrap_or_default(),
                source,
            })?;

            Ok(None)
        }
        Command::Buildkernel { targets, count, .. } => {
            let args = BuildArgs {
                dirs: parse_dirs(&targets.dirs),
                nodes: targets.nodes,
                count,
            };

            workloads::build_kernel(ctx, &mut executor, &args).map(Some)
        }
        Command::BuildWorker { targets } => {
            workloads::build_worker(ctx, &parse_dirs(&targets.dirs), &targets.nodes).map(Some)
        }
        Command::CrossDelete { targets, count, .. } => {
            let args = CrossDeleteArgs {
                dirs: parse_dirs(&targets.dirs),
                nodes: targets.nodes,
                count,
            };

            workloads::cross_delete(ctx, &mut executor, &args, &mut rand::thread_rng()).map(Some)
        }
        Command::CrdelWorker {
            phase, stage, dirs, ..
        } => {
            let handled =
                workloads::crdel_worker(ctx, &stage, phase, dirs.as_deref().map(parse_dirs))?;
            info!(handled = handled, "Worker done");

            Ok(None)
        }
        Command::Run {
            nodes,
            name,
            cwd,
            log,
            program,
            args,
            ..
        } => {
            let name = name.unwrap_or_else(|| {
                program
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "run".to_owned())
            });
            let args = RunArgs {
                name,
                nodes,
                program,
                args,
                cwd,
                log,
            };

            workloads::run(ctx, &mut executor, &args).map(Some)
        }
    }
}

fn write_report(path: &Path, report: &RunReport) {
    let file = match File::create(path) {
        Ok(file) => file,
        Err(error) => {
            error!(path = ?path, error = %error, "Failed to create run report");
            return;
        }
    };

    match serde_yaml::to_writer(file, report) {
        Ok(()) => info!(path = ?path, "Wrote run report"),
        Err(error) => error!(path = ?path, error = %error, "Failed to write run report"),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => match HarnessConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("Failed to load {}: {error}", path.to_string_lossy());

                return ExitCode::FAILURE;
            }
        },
        None => HarnessConfig::default(),
    };

    if cli.logfile.is_some() {
        config.paths.logfile = cli.logfile.clone();
    }
    if let Some(ref path) = cli.database {
        config.database = Some(DatabaseConfig { path: path.clone() });
    }
    if let Some(backend) = cli.backend {
        config.launcher.backend = backend;
    }
    cli.command.apply(&mut config);

    if let Err(error) = logging::init(config.paths.logfile.as_deref(), cli.debug) {
        eprintln!("Failed to set up logging: {error}");

        return ExitCode::FAILURE;
    }

    let hostname = cli
        .hostname
        .clone()
        .unwrap_or_else(|| local_hostname().to_owned());
    let _span = info_span!("cfs-runner", host = %hostname).entered();

    if let Some((needs_launcher, needs_tarfile)) = cli.command.requirements() {
        if config.preflight_checks(needs_launcher, needs_tarfile) {
            error!("Config failed preflight checks, aborting");

            return ExitCode::FAILURE;
        }
    }

    let store = match StorageAdapters::load(config.database.as_ref()) {
        Ok(store) => store,
        Err(error) => {
            error!(error = %error, "Failed to open the results database");

            return ExitCode::FAILURE;
        }
    };

    let mut ctx = RunContext::new(config, hostname);
    ctx.config_path = cli.config.clone();
    ctx.debug = cli.debug;
    ctx.store = store;

    if let Err(errno) = install_interrupt_handler(&ctx.cancel) {
        warn!(errno = ?errno, "Failed to install the interrupt handler");
    }

    let name = cli.command.name();
    info!(command = name, "Starting");

    let result = dispatch(&ctx, cli.command);

    if let Err(error) = ctx.store.close() {
        warn!(error = %error, "Failed to close the results database");
    }

    match result {
        Ok(Some(report)) => {
            if let Some(ref path) = cli.report {
                write_report(path, &report);
            }

            if report.success() {
                info!(command = name, "Finished successfully");

                ExitCode::SUCCESS
            } else {
                error!(
                    command = name,
                    failed = report.failures().count(),
                    "Finished with failed workers"
                );

                ExitCode::FAILURE
            }
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(error) => {
            error!(command = name, error = %error, "Failed");

            ExitCode::FAILURE
        }
    }
}
