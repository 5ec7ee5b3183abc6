use std::io;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use super::child::{self, PreparedChild};
use super::watchdog::Watchdog;
use super::{ExecutionReport, ExecutionRequest, ExecutorError, Result, Termination};

/// Raw status and usage returned by `wait4`
struct Reaped {
    status: libc::c_int,
    usage: libc::rusage,
}

/// Controller side of one execution
pub(super) fn run(request: &ExecutionRequest) -> Result<ExecutionReport> {
    let prepared = PreparedChild::new(request)?;
    let (status_read, status_write) = child::status_pipe().map_err(ExecutorError::SpawnFailed)?;

    log::debug!(
        "Executing {:?} with cpu limit {}s, memory limit {} MB",
        request.command(),
        request.cpu_time_limit(),
        request.memory_limit_mb()
    );

    // SAFETY: the child branch only runs `PreparedChild::enter`, which sticks
    // to async-signal-safe calls and never returns.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = io::Error::last_os_error();
        log::error!("fork failed: {err}");
        return Err(ExecutorError::SpawnFailed(err));
    }
    if pid == 0 {
        // SAFETY: this is the child branch of the fork above.
        unsafe { prepared.enter(status_write.as_raw_fd()) }
    }

    let start = Instant::now();
    drop(status_write);

    let watchdog = match request.wall_time_limit() {
        Some(limit) => match Watchdog::arm(pid, limit) {
            Ok(watchdog) => Some(watchdog),
            Err(e) => {
                log::error!("Failed to start watchdog for process {pid}: {e}");
                // SAFETY: the child is not reaped yet, so `pid` is still ours.
                unsafe { libc::kill(pid, libc::SIGKILL) };
                let _ = reap(pid);
                return Err(ExecutorError::SpawnFailed(e));
            }
        },
        None => None,
    };

    let child_failure = child::read_failure(status_read);

    let wall_limit_exceeded = match watchdog {
        Some(watchdog) => {
            // On error the watchdog is stopped by its drop.
            wait_terminated(pid)?;
            watchdog.disarm()
        }
        None => false,
    };
    let reaped = reap(pid)?;
    let wall_time = start.elapsed();

    let report = ExecutionReport {
        termination: Termination::from_wait_status(reaped.status),
        user_time: timeval_to_duration(reaped.usage.ru_utime),
        system_time: timeval_to_duration(reaped.usage.ru_stime),
        peak_memory_kb: peak_memory_kb(&reaped.usage),
        wall_time,
        child_failure,
        wall_limit_exceeded,
    };

    match &report.child_failure {
        Some(failure) => log::warn!("Process {pid} ({}) {failure}", request.program()),
        None => log::debug!("Process {pid} finished: {}", report.termination),
    }

    Ok(report)
}

/// Blocks until the child has terminated without reaping it
fn wait_terminated(pid: libc::pid_t) -> Result<()> {
    loop {
        // SAFETY: zeroed siginfo_t is a valid out-parameter.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a valid pointer for the duration of the call.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(ExecutorError::WaitFailed { pid, source: err });
        }
    }
}

/// Reaps the child, collecting its status and resource usage
fn reap(pid: libc::pid_t) -> Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: zeroed rusage is a valid out-parameter.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: both out-parameters are valid for the duration of the call.
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok(Reaped { status, usage });
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(ExecutorError::WaitFailed { pid, source: err });
        }
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = tv.tv_sec.max(0) as u64;
    let micros = tv.tv_usec.clamp(0, 999_999) as u32;
    Duration::new(secs, micros * 1000)
}

/// `ru_maxrss` in kilobytes; Apple platforms report bytes
fn peak_memory_kb(usage: &libc::rusage) -> u64 {
    let raw = usage.ru_maxrss.max(0) as u64;
    if cfg!(any(target_os = "macos", target_os = "ios")) {
        raw / 1024
    } else {
        raw
    }
}
