use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ExecutorError, Result};

pub const DEFAULT_STDOUT_FILE: &str = "stdout.txt";
pub const DEFAULT_STDERR_FILE: &str = "stderr.txt";

/// Files receiving the child's standard output and standard error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl OutputPaths {
    /// Default file names placed inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            stdout: dir.join(DEFAULT_STDOUT_FILE),
            stderr: dir.join(DEFAULT_STDERR_FILE),
        }
    }
}

impl Default for OutputPaths {
    /// `stdout.txt` and `stderr.txt`, relative to the working directory at execution time
    fn default() -> Self {
        Self {
            stdout: PathBuf::from(DEFAULT_STDOUT_FILE),
            stderr: PathBuf::from(DEFAULT_STDERR_FILE),
        }
    }
}

/// A validated description of one program run
///
/// Fields are private so that a request can only exist in a state the child
/// is able to act on without further checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    command: Vec<String>,
    cpu_time_limit: u64,
    memory_limit_mb: u64,
    output: OutputPaths,
    wall_time_limit: Option<Duration>,
}

impl ExecutionRequest {
    /// Creates a request for `command` with a CPU limit in seconds and a memory limit in megabytes
    ///
    /// The first element of `command` is the program, looked up through
    /// `PATH` unless it contains a slash.
    pub fn new<I, S>(command: I, cpu_time_limit: u64, memory_limit_mb: u64) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();

        match command.first() {
            None => return Err(invalid("command must not be empty")),
            Some(program) if program.is_empty() => {
                return Err(invalid("program name must not be empty"));
            }
            Some(_) => {}
        }
        if let Some(arg) = command.iter().find(|arg| arg.contains('\0')) {
            return Err(invalid(format!("argument {arg:?} contains a NUL byte")));
        }

        if cpu_time_limit == 0 {
            return Err(invalid("CPU time limit must be at least one second"));
        }
        // The hard limit sits one second above the soft one.
        if cpu_time_limit
            .checked_add(1)
            .is_none_or(|hard| hard as u128 >= libc::RLIM_INFINITY as u128)
        {
            return Err(invalid(format!(
                "CPU time limit of {cpu_time_limit}s is too large"
            )));
        }

        if memory_limit_mb == 0 {
            return Err(invalid("memory limit must be at least one megabyte"));
        }
        if memory_limit_mb
            .checked_mul(1024 * 1024)
            .is_none_or(|bytes| bytes as u128 >= libc::RLIM_INFINITY as u128)
        {
            return Err(invalid(format!(
                "memory limit of {memory_limit_mb} MB is too large"
            )));
        }

        Ok(Self {
            command,
            cpu_time_limit,
            memory_limit_mb,
            output: OutputPaths::default(),
            wall_time_limit: None,
        })
    }

    /// Replaces the redirection targets
    pub fn with_output(mut self, output: OutputPaths) -> Result<Self> {
        for path in [&output.stdout, &output.stderr] {
            if path.as_os_str().is_empty() {
                return Err(invalid("output path must not be empty"));
            }
            if path.as_os_str().as_encoded_bytes().contains(&0) {
                return Err(invalid(format!(
                    "output path {} contains a NUL byte",
                    path.display()
                )));
            }
        }
        self.output = output;
        Ok(self)
    }

    /// Arms a wall-clock watchdog that kills the child once `limit` has elapsed
    pub fn with_wall_time_limit(mut self, limit: Option<Duration>) -> Result<Self> {
        if limit.is_some_and(|limit| limit.is_zero()) {
            return Err(invalid("wall time limit must be positive"));
        }
        self.wall_time_limit = limit;
        Ok(self)
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn program(&self) -> &str {
        &self.command[0]
    }

    /// CPU-time limit in seconds
    pub fn cpu_time_limit(&self) -> u64 {
        self.cpu_time_limit
    }

    /// Memory limit in megabytes
    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    /// Address-space ceiling in bytes
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    pub fn output(&self) -> &OutputPaths {
        &self.output
    }

    pub fn wall_time_limit(&self) -> Option<Duration> {
        self.wall_time_limit
    }
}

fn invalid(message: impl Into<String>) -> ExecutorError {
    ExecutorError::InvalidRequest(message.into())
}
