use std::{
    ffi::{OsStr, OsString},
    fmt,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};
use tracing::debug;

/// A program with its argument vector, working directory and an optional log
/// file receiving both stdout and stderr.
///
/// Commands are always executed directly, never through a local shell. The
/// quoted form from [`CommandSpec::shell_line`] exists only for launchers that
/// hand a command line to a remote shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    log: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            cwd: None,
            log: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// append `flag value` only when a value is present
    pub fn opt_arg(self, flag: &str, value: Option<impl AsRef<OsStr>>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn log_to(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    /// program followed by its arguments
    pub fn argv(&self) -> impl Iterator<Item = &OsStr> {
        std::iter::once(self.program.as_os_str()).chain(self.args.iter().map(OsString::as_os_str))
    }

    /// Build the process, stdout and stderr are appended to the log file if one is set
    pub fn to_command(&self) -> io::Result<Command> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());

        if let Some(ref cwd) = self.cwd {
            command.current_dir(cwd);
        }

        if let Some(ref log) = self.log {
            let stdout = OpenOptions::new().create(true).append(true).open(log)?;
            let stderr = stdout.try_clone()?;

            command.stdout(stdout).stderr(stderr);
        }

        Ok(command)
    }

    /// run synchronously and return the exit status
    pub fn status(&self) -> io::Result<ExitStatus> {
        debug!(command = %self, "Running");

        self.to_command()?.status()
    }

    /// single quoted command line, prefixed with a `cd` when a working directory is set
    pub fn shell_line(&self) -> String {
        let line = self
            .argv()
            .map(|arg| shell_quote(&arg.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ");

        match self.cwd {
            Some(ref cwd) => format!("cd {} && {line}", shell_quote(&cwd.to_string_lossy())),
            None => line,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shell_line())
    }
}

/// quote `word` for a POSIX shell, plain words are left as is
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));

    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
