use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Termination {
    /// Ran to completion with this exit code
    Exited(i32),
    /// Killed by this signal, including `SIGXCPU` from the CPU limit
    Signaled(i32),
}

impl Termination {
    /// Decodes a raw status from the wait family of calls
    pub fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Exited(libc::WEXITSTATUS(status))
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Exited(0)
    }

    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Signaled(_) => None,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled(signal) => Some(signal),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Exited(code) => write!(f, "Exit Code: {code}"),
            Self::Signaled(signal) => match signal_name(signal) {
                Some(name) => write!(f, "Terminated by Signal: {signal} ({name})"),
                None => write!(f, "Terminated by Signal: {signal}"),
            },
        }
    }
}

/// Symbolic name of the signals a limited run commonly ends with
pub fn signal_name(signal: i32) -> Option<&'static str> {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGSYS => "SIGSYS",
        _ => return None,
    };
    Some(name)
}

/// Step of the child setup that failed before the target could run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Redirect,
    Limits,
    Exec,
}

impl SetupStage {
    pub(super) fn code(self) -> i32 {
        match self {
            Self::Redirect => 1,
            Self::Limits => 2,
            Self::Exec => 3,
        }
    }

    pub(super) fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Redirect),
            2 => Some(Self::Limits),
            3 => Some(Self::Exec),
            _ => None,
        }
    }
}

/// A failure the child reported over the status pipe before exiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildFailure {
    pub stage: SetupStage,
    pub errno: i32,
}

impl fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.stage {
            SetupStage::Redirect => "could not redirect output",
            SetupStage::Limits => "could not apply resource limits",
            SetupStage::Exec => "could not execute program",
        };
        let cause = std::io::Error::from_raw_os_error(self.errno);
        write!(f, "{what}: {cause}")
    }
}

/// Outcome and resource usage of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub termination: Termination,
    #[serde(rename = "user_time_us", serialize_with = "as_micros")]
    pub user_time: Duration,
    #[serde(rename = "system_time_us", serialize_with = "as_micros")]
    pub system_time: Duration,
    /// Peak resident set size of the child and its reaped descendants
    pub peak_memory_kb: u64,
    #[serde(rename = "wall_time_us", serialize_with = "as_micros")]
    pub wall_time: Duration,
    pub child_failure: Option<ChildFailure>,
    pub wall_limit_exceeded: bool,
}

impl ExecutionReport {
    /// User plus system time
    pub fn cpu_time(&self) -> Duration {
        self.user_time + self.system_time
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Sandbox Report ===")?;
        writeln!(f, "{}", self.termination)?;
        if let Some(failure) = &self.child_failure {
            writeln!(f, "Setup Failure: {failure}")?;
        }
        writeln!(
            f,
            "User Time: {}.{:06}s",
            self.user_time.as_secs(),
            self.user_time.subsec_micros()
        )?;
        writeln!(
            f,
            "System Time: {}.{:06}s",
            self.system_time.as_secs(),
            self.system_time.subsec_micros()
        )?;
        writeln!(f, "Max Memory: {} KB", self.peak_memory_kb)?;
        write!(f, "Total Time: {:.2}s", self.wall_time.as_secs_f64())?;
        if self.wall_limit_exceeded {
            write!(f, "\nWall Limit: exceeded")?;
        }
        Ok(())
    }
}

fn as_micros<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_micros().min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_report() -> ExecutionReport {
        ExecutionReport {
            termination: Termination::Exited(0),
            user_time: Duration::from_micros(1_234_567),
            system_time: Duration::from_micros(8_001),
            peak_memory_kb: 1536,
            wall_time: Duration::from_millis(1_506),
            child_failure: None,
            wall_limit_exceeded: false,
        }
    }

    #[test]
    fn test_termination_from_wait_status() {
        // Exit codes sit in the second byte, signals in the low seven bits.
        assert_eq!(Termination::from_wait_status(0), Termination::Exited(0));
        assert_eq!(Termination::from_wait_status(42 << 8), Termination::Exited(42));
        assert_eq!(
            Termination::from_wait_status(255 << 8),
            Termination::Exited(255)
        );
        assert_eq!(
            Termination::from_wait_status(libc::SIGXCPU),
            Termination::Signaled(libc::SIGXCPU)
        );
        assert_eq!(
            Termination::from_wait_status(libc::SIGSEGV | 0x80),
            Termination::Signaled(libc::SIGSEGV)
        );
    }

    #[test]
    fn test_termination_accessors() {
        assert!(Termination::Exited(0).is_success());
        assert!(!Termination::Exited(1).is_success());
        assert!(!Termination::Signaled(libc::SIGKILL).is_success());
        assert_eq!(Termination::Exited(3).exit_code(), Some(3));
        assert_eq!(Termination::Exited(3).signal(), None);
        assert_eq!(Termination::Signaled(9).signal(), Some(9));
    }

    #[test]
    fn test_report_display() {
        let expected = "=== Sandbox Report ===\n\
                        Exit Code: 0\n\
                        User Time: 1.234567s\n\
                        System Time: 0.008001s\n\
                        Max Memory: 1536 KB\n\
                        Total Time: 1.51s";
        assert_eq!(sample_report().to_string(), expected);
    }

    #[test]
    fn test_report_display_with_failures() {
        let report = ExecutionReport {
            termination: Termination::Exited(127),
            child_failure: Some(ChildFailure {
                stage: SetupStage::Exec,
                errno: libc::ENOENT,
            }),
            wall_limit_exceeded: true,
            ..sample_report()
        };
        let text = report.to_string();
        assert!(text.contains("Exit Code: 127\n"));
        assert!(text.contains("Setup Failure: could not execute program: "));
        assert!(text.ends_with("\nWall Limit: exceeded"));
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(
            Termination::Signaled(libc::SIGXCPU).to_string(),
            format!("Terminated by Signal: {} (SIGXCPU)", libc::SIGXCPU)
        );
        assert_eq!(signal_name(libc::SIGKILL), Some("SIGKILL"));
        assert_eq!(signal_name(0), None);
    }

    #[test]
    fn test_report_serialization() {
        let value = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "termination": { "kind": "exited", "value": 0 },
                "user_time_us": 1_234_567,
                "system_time_us": 8_001,
                "peak_memory_kb": 1536,
                "wall_time_us": 1_506_000,
                "child_failure": null,
                "wall_limit_exceeded": false,
            })
        );
    }
}
