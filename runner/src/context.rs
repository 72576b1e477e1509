use crate::{
    command::CommandSpec,
    completion::{CancelToken, RunReport},
    config::HarnessConfig,
    database::StorageAdapters,
};
use once_cell::sync::OnceCell;
use std::{env, io, path::PathBuf};
use tracing::{error, info, warn};

static HOSTNAME: OnceCell<String> = OnceCell::new();

/// hostname of this node, resolved once
pub fn local_hostname() -> &'static str {
    HOSTNAME.get_or_init(|| match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname, falling back to localhost");

            "localhost".to_owned()
        }
    })
}

/// Everything an operation needs to know about the current invocation
#[derive(Debug)]
pub struct RunContext {
    pub config: HarnessConfig,
    pub hostname: String,
    // forwarded to worker invocations
    pub config_path: Option<PathBuf>,
    pub debug: bool,
    pub cancel: CancelToken,
    pub store: StorageAdapters,
}

impl RunContext {
    pub fn new(config: HarnessConfig, hostname: impl Into<String>) -> Self {
        Self {
            config,
            hostname: hostname.into(),
            config_path: None,
            debug: false,
            cancel: CancelToken::new(),
            store: StorageAdapters::Null,
        }
    }

    pub fn self_exe(&self) -> io::Result<PathBuf> {
        match self.config.launcher.self_exe {
            Some(ref exe) => Ok(exe.clone()),
            None => env::current_exe(),
        }
    }

    /// Invocation of this binary for a worker subcommand, carrying the
    /// global options of the coordinator
    pub fn worker_command(&self, subcommand: &str) -> io::Result<CommandSpec> {
        let mut spec = CommandSpec::new(self.self_exe()?)
            .opt_arg("--config", self.config_path.as_ref())
            .opt_arg("--logfile", self.config.paths.logfile.as_ref());

        if self.debug {
            spec = spec.arg("--debug");
        }

        Ok(spec.arg(subcommand))
    }

    /// log the outcome of a fan-out and hand it to the results store
    pub fn record(&self, report: &RunReport) {
        if report.success() {
            info!(
                name = %report.name,
                workers = report.outcomes.len(),
                detached = report.detached.len(),
                "Run successful"
            );
        } else {
            for failure in report.failures() {
                error!(
                    name = %report.name,
                    slot = failure.slot,
                    label = %failure.label,
                    kind = ?failure.kind,
                    code = ?failure.code,
                    "Worker failed"
                );
            }
        }

        if let Err(error) = self.store.store(report) {
            warn!(error = ?error, "Failed to store run report");
        }
    }
}
