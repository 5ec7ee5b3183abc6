mod child;
mod controller;
mod limits;
mod report;
mod request;
mod watchdog;

pub use report::{ChildFailure, ExecutionReport, SetupStage, Termination, signal_name};
pub use request::{DEFAULT_STDERR_FILE, DEFAULT_STDOUT_FILE, ExecutionRequest, OutputPaths};

/// Exit status of a child whose stdout/stderr could not be redirected
pub const EXIT_REDIRECT_FAILED: i32 = 125;
/// Exit status of a child whose resource limits could not be applied
pub const EXIT_LIMITS_FAILED: i32 = 126;
/// Exit status of a child whose target program could not be executed
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Errors surfaced by [`execute`]
///
/// Failures that happen inside the child after the fork are never returned
/// here: they show up in the report as an exit status plus an optional
/// [`ChildFailure`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("failed to create child process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to wait for child process {pid}: {source}")]
    WaitFailed {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Runs one command in a forked child under CPU-time and address-space limits
///
/// The executor holds no state between runs, so a single instance can be
/// reused for any number of sequential requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LimitedExecutor;

impl LimitedExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Forks, applies limits in the child, execs the target and blocks until it terminates
    pub fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        controller::run(&request)
    }
}

/// Shorthand for `LimitedExecutor::new().execute(request)`
pub fn execute(request: ExecutionRequest) -> Result<ExecutionReport> {
    LimitedExecutor::new().execute(request)
}
