use crate::{completion::WaitOptions, nodes::PairingStrategy};
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// resolve a bare program name through PATH, paths with a separator are returned as is
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return Some(program.to_path_buf());
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config file could not be parsed")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config failed preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    // how workers pick the tree of another node
    #[serde(default)]
    pub pairing: PairingStrategy,
    // clear node trees before every coordinator run
    #[serde(default)]
    pub cleanup_before_run: bool,
    // minimal number of MPI processes, raised to the node count when smaller
    #[serde(default = "default_nproc")]
    pub nproc: usize,

    #[serde(default, alias = "db")]
    pub database: Option<DatabaseConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            paths: PathsConfig::default(),
            kernel: KernelConfig::default(),
            wait: WaitConfig::default(),
            pairing: PairingStrategy::default(),
            cleanup_before_run: false,
            nproc: default_nproc(),
            database: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Ssh,
    #[default]
    Mpi,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteShell {
    #[default]
    Ssh,
    Rsh,
}

impl RemoteShell {
    pub fn program(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Rsh => "rsh",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Wait,
    NoWait,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_mpirun")]
    pub mpirun: PathBuf,
    #[serde(default)]
    pub remote_shell: RemoteShell,
    // network interface used for MPI traffic
    pub interface: Option<String>,
    #[serde(default)]
    pub mode: LaunchMode,
    #[serde(default = "default_hostfile")]
    pub hostfile: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
    // binary started on the nodes for worker subcommands, defaults to the running binary
    pub self_exe: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            mpirun: default_mpirun(),
            remote_shell: RemoteShell::default(),
            interface: None,
            mode: LaunchMode::default(),
            hostfile: default_hostfile(),
            extra_args: Vec::new(),
            self_exe: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub logfile: Option<PathBuf>,
    // falls back to the first test directory
    pub stagedir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    pub tarfile: Option<PathBuf>,
    #[serde(default = "default_kernel_dir")]
    pub dir_name: String,
    // copied to <tree>/<dir_name>/.config after extraction
    pub config_file: Option<PathBuf>,
    #[serde(default = "default_make")]
    pub make: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tarfile: None,
            dir_name: default_kernel_dir(),
            config_file: None,
            make: default_make(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WaitConfig {
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,
    pub timeout: Option<u64>,
    pub failure_marker: Option<String>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            status_interval: default_status_interval(),
            timeout: None,
            failure_marker: None,
        }
    }
}

impl WaitConfig {
    pub fn options(&self) -> WaitOptions {
        WaitOptions {
            status_interval: Duration::from_secs(self.status_interval),
            timeout: self.timeout.map(Duration::from_secs),
            failure_marker: self.failure_marker.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|_| ConfigErrors::FileNotFound(path.to_path_buf()))?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// process count handed to the launcher for `nodes` targets
    pub fn nproc_for(&self, nodes: usize) -> usize {
        self.nproc.max(nodes)
    }

    /// Validate the config, reporting every problem instead of stopping at the first one.
    /// Returns true if an error was found.
    pub fn preflight_checks(&self, needs_launcher: bool, needs_tarfile: bool) -> bool {
        let mut contains_error = false;

        if needs_launcher && self.launcher.backend == Backend::Mpi {
            match resolve_program(&self.launcher.mpirun) {
                None => {
                    error!(
                        "launcher.mpirun ({}) was not found",
                        self.launcher.mpirun.to_string_lossy()
                    );
                    contains_error = true;
                }
                Some(path) => match check_executable(&path) {
                    Ok(true) => (),
                    Ok(false) => {
                        error!("launcher.mpirun ({}) is not executable", path.to_string_lossy());
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if launcher.mpirun ({}) is an executable: {e}",
                            path.to_string_lossy()
                        );
                        contains_error = true;
                    }
                },
            }
        }

        if let Some(ref exe) = self.launcher.self_exe {
            if !exe.is_file() {
                warn!(
                    "launcher.self_exe ({}) is not present on this host, it has to exist on the nodes",
                    exe.to_string_lossy()
                );
            }
        }

        if needs_tarfile {
            match self.kernel.tarfile {
                None => {
                    error!("A kernel tarball is required, set kernel.tarfile or pass --tarfile");
                    contains_error = true;
                }
                Some(ref tarfile) if !tarfile.is_file() => {
                    error!("kernel.tarfile ({}) was not found", tarfile.to_string_lossy());
                    contains_error = true;
                }
                Some(_) => (),
            }
        }

        if let Some(ref config_file) = self.kernel.config_file {
            if !config_file.is_file() {
                error!("kernel.config_file ({}) was not found", config_file.to_string_lossy());
                contains_error = true;
            }
        }

        if self.kernel.dir_name.is_empty() || self.kernel.dir_name.contains('/') {
            error!("kernel.dir_name must be a single, non empty path component");
            contains_error = true;
        }

        if self.wait.status_interval == 0 {
            error!("wait.status_interval cannot be 0");
            contains_error = true;
        }

        if self.wait.timeout == Some(0) {
            error!("wait.timeout cannot be 0, leave it out to wait without a deadline");
            contains_error = true;
        }

        if self.nproc == 0 {
            error!("nproc cannot be 0");
            contains_error = true;
        }

        if self.launcher.mode == LaunchMode::NoWait && self.database.is_some() {
            warn!("launcher.mode is nowait, detached workers won't be recorded in the database");
        }

        contains_error
    }
}

fn default_mpirun() -> PathBuf {
    PathBuf::from("/usr/bin/mpirun")
}

fn default_hostfile() -> PathBuf {
    env::temp_dir().join("cfs-runner.hosts")
}

fn default_kernel_dir() -> String {
    "linux".to_owned()
}

fn default_make() -> PathBuf {
    PathBuf::from("make")
}

fn default_status_interval() -> u64 {
    30
}

fn default_nproc() -> usize {
    1
}
