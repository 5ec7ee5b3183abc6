//! Everything that runs between `fork` and `exec`.
//!
//! The calling process may be multi-threaded, so once forked the child is
//! restricted to async-signal-safe system calls: no allocation, no locks, no
//! logging. [`PreparedChild::new`] therefore builds every C string and
//! pointer array up front, in the parent.

use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::{c_char, c_int};

use super::limits::ResourceLimits;
use super::report::{ChildFailure, SetupStage};
use super::{
    EXIT_EXEC_FAILED, EXIT_LIMITS_FAILED, EXIT_REDIRECT_FAILED, ExecutionRequest, ExecutorError,
    Result,
};

/// `PATH` used when the environment has none, matching glibc's `execvp`
const DEFAULT_SEARCH_PATH: &str = "/bin:/usr/bin";

/// Interpreter for executables the kernel rejects with `ENOEXEC`
const FALLBACK_SHELL: &str = "/bin/sh";

/// Size of a failure record on the status pipe: stage then errno
const RECORD_LEN: usize = 8;

/// Read-only data the child acts on
pub(super) struct PreparedChild {
    // Owns the strings `argv_ptrs` points into.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    candidates: Vec<CString>,
    shell: CString,
    // `[shell, candidate, args[1..]..., NULL]`, one per candidate.
    shell_argv: Vec<Vec<*const c_char>>,
    stdout: CString,
    stderr: CString,
    limits: ResourceLimits,
}

impl PreparedChild {
    pub(super) fn new(request: &ExecutionRequest) -> Result<Self> {
        let argv = request
            .command()
            .iter()
            .map(|arg| c_string(arg.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let search_path = std::env::var_os("PATH");
        let candidates = search_candidates(request.program(), search_path.as_deref())
            .into_iter()
            .map(|path| c_string(path.as_os_str().as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        let shell = c_string(FALLBACK_SHELL.as_bytes())?;
        let shell_argv = candidates
            .iter()
            .map(|candidate| {
                let mut ptrs = vec![shell.as_ptr(), candidate.as_ptr()];
                ptrs.extend_from_slice(&argv_ptrs[1..]);
                ptrs
            })
            .collect();

        Ok(Self {
            _argv: argv,
            argv_ptrs,
            candidates,
            shell,
            shell_argv,
            stdout: c_string(request.output().stdout.as_os_str().as_bytes())?,
            stderr: c_string(request.output().stderr.as_os_str().as_bytes())?,
            limits: ResourceLimits::from_request(request),
        })
    }

    /// Redirects output, applies limits and replaces the process image
    ///
    /// Never returns: either the target program takes over or the child
    /// exits with one of the reserved statuses after writing a failure
    /// record to `status_fd`.
    ///
    /// # Safety
    ///
    /// Must only be called in the child branch of a `fork`.
    pub(super) unsafe fn enter(&self, status_fd: RawFd) -> ! {
        reset_signals();

        for (path, target) in [
            (&self.stdout, libc::STDOUT_FILENO),
            (&self.stderr, libc::STDERR_FILENO),
        ] {
            if let Err(errno) = redirect(path, target) {
                abort_setup(status_fd, SetupStage::Redirect, errno, EXIT_REDIRECT_FAILED);
            }
        }

        if let Err(errno) = self.limits.apply() {
            abort_setup(status_fd, SetupStage::Limits, errno, EXIT_LIMITS_FAILED);
        }

        let errno = self.exec();
        abort_setup(status_fd, SetupStage::Exec, errno, EXIT_EXEC_FAILED)
    }

    /// Tries every candidate the way `execvp` walks `PATH`
    ///
    /// An executable without a recognised header is handed to `/bin/sh`,
    /// as `execvp` does for shebang-less scripts.
    fn exec(&self) -> c_int {
        let mut last = libc::ENOENT;
        let mut denied = false;

        for (candidate, shell_argv) in self.candidates.iter().zip(&self.shell_argv) {
            // SAFETY: candidate and argv are NUL-terminated and outlive the call.
            unsafe { libc::execv(candidate.as_ptr(), self.argv_ptrs.as_ptr()) };
            let mut errno = errno();
            if errno == libc::ENOEXEC {
                // SAFETY: same as above, the shell argv was built before the fork.
                unsafe { libc::execv(self.shell.as_ptr(), shell_argv.as_ptr()) };
                errno = self::errno();
            }
            match errno {
                libc::EACCES => denied = true,
                libc::ENOENT | libc::ENOTDIR | libc::ESTALE | libc::ELOOP | libc::ENAMETOOLONG
                | libc::ENODEV | libc::ETIMEDOUT => {}
                _ => return errno,
            }
            last = errno;
        }

        if denied { libc::EACCES } else { last }
    }
}

/// Paths to try for `program`, in order
///
/// A name containing a slash is used as-is; anything else is joined onto
/// each `PATH` entry, an empty entry meaning the current directory.
pub(super) fn search_candidates(program: &str, search_path: Option<&OsStr>) -> Vec<PathBuf> {
    if program.contains('/') {
        return vec![PathBuf::from(program)];
    }

    let search_path = search_path.unwrap_or(OsStr::new(DEFAULT_SEARCH_PATH));
    search_path
        .as_bytes()
        .split(|byte| *byte == b':')
        .map(|dir| {
            if dir.is_empty() {
                Path::new(".").join(program)
            } else {
                Path::new(OsStr::from_bytes(dir)).join(program)
            }
        })
        .collect()
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        ExecutorError::InvalidRequest(format!(
            "{:?} contains a NUL byte",
            String::from_utf8_lossy(bytes)
        ))
    })
}

pub(super) fn errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Creates the close-on-exec pipe carrying setup failures from child to parent
///
/// Returns `(read, write)`. A successful exec closes the write end without
/// anything written, so the parent reads EOF.
pub(super) fn status_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];
    if create_cloexec_pipe(&mut fds) != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are freshly created and owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn create_cloexec_pipe(fds: &mut [c_int; 2]) -> c_int {
    // SAFETY: `fds` has room for the two descriptors.
    unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn create_cloexec_pipe(fds: &mut [c_int; 2]) -> c_int {
    // SAFETY: `fds` has room for the two descriptors.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc == 0 {
        for fd in *fds {
            // SAFETY: `fd` was just returned by pipe().
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
    }
    rc
}

/// Reads the child's failure record, if it wrote one
///
/// Blocks until the child either execs or exits.
pub(super) fn read_failure(read_end: OwnedFd) -> Option<ChildFailure> {
    let mut buf = Vec::with_capacity(RECORD_LEN);
    if let Err(e) = File::from(read_end).read_to_end(&mut buf) {
        log::warn!("Failed to read child status pipe: {e}");
        return None;
    }

    match buf.len() {
        0 => None,
        RECORD_LEN => decode_record(&buf),
        n => {
            log::warn!("Ignoring truncated child status record of {n} bytes");
            None
        }
    }
}

fn encode_record(stage: SetupStage, errno: c_int) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..4].copy_from_slice(&stage.code().to_ne_bytes());
    record[4..].copy_from_slice(&errno.to_ne_bytes());
    record
}

fn decode_record(buf: &[u8]) -> Option<ChildFailure> {
    let stage = i32::from_ne_bytes(buf[..4].try_into().ok()?);
    let errno = i32::from_ne_bytes(buf[4..RECORD_LEN].try_into().ok()?);
    Some(ChildFailure {
        stage: SetupStage::from_code(stage)?,
        errno,
    })
}

fn abort_setup(status_fd: RawFd, stage: SetupStage, errno: c_int, exit_code: c_int) -> ! {
    let record = encode_record(stage, errno);
    let mut written = 0;
    while written < record.len() {
        // SAFETY: the slice is valid for the given length.
        let rc = unsafe {
            libc::write(
                status_fd,
                record[written..].as_ptr().cast(),
                record.len() - written,
            )
        };
        if rc > 0 {
            written += rc as usize;
        } else if rc < 0 && errno_is_interrupt() {
            continue;
        } else {
            break;
        }
    }
    // SAFETY: `_exit` skips atexit handlers and stdio flushing inherited from the parent.
    unsafe { libc::_exit(exit_code) }
}

fn errno_is_interrupt() -> bool {
    errno() == libc::EINTR
}

/// Opens `path` truncated and moves it onto `target`
fn redirect(path: &CStr, target: c_int) -> std::result::Result<(), c_int> {
    // SAFETY: `path` is NUL-terminated.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(errno());
    }

    // The parent had `target` closed, so open() handed it back directly.
    if fd == target {
        // SAFETY: `fd` is open; clearing FD_CLOEXEC keeps it across exec.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } < 0 {
            return Err(errno());
        }
        return Ok(());
    }

    // SAFETY: both descriptors are valid; dup2 leaves FD_CLOEXEC cleared on `target`.
    let rc = unsafe { libc::dup2(fd, target) };
    let result = if rc < 0 { Err(errno()) } else { Ok(()) };
    // SAFETY: `fd` is ours and no longer needed.
    unsafe { libc::close(fd) };
    result
}

/// Restores default dispositions the parent may have changed
///
/// Rust binaries ignore `SIGPIPE`, and ignored signals survive exec.
fn reset_signals() {
    // SAFETY: async-signal-safe calls on a stack-local signal set.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        libc::signal(libc::SIGXCPU, libc::SIG_DFL);

        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}
