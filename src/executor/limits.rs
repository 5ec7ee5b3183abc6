use libc::{c_int, rlim_t};

use super::ExecutionRequest;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = c_int;

/// Raw rlimit values for one child, computed before the fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ResourceLimits {
    /// `SIGXCPU` is delivered when CPU time reaches this many seconds
    pub cpu_soft: rlim_t,
    /// `SIGKILL` follows here if `SIGXCPU` did not end the process
    pub cpu_hard: rlim_t,
    /// Address-space ceiling in bytes
    pub address_space: rlim_t,
}

impl ResourceLimits {
    pub(super) fn from_request(request: &ExecutionRequest) -> Self {
        let cpu = request.cpu_time_limit() as rlim_t;
        Self {
            cpu_soft: cpu,
            cpu_hard: cpu + 1,
            address_space: request.memory_limit_bytes() as rlim_t,
        }
    }

    /// Applies the limits to the calling process
    ///
    /// Only makes async-signal-safe calls; meant to run in a freshly forked
    /// child. Returns the errno of the first failing `setrlimit`.
    pub(super) fn apply(&self) -> Result<(), c_int> {
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        set_rlimit(libc::RLIMIT_CPU, self.cpu_soft, self.cpu_hard)?;
        set_rlimit(libc::RLIMIT_AS, self.address_space, self.address_space)?;
        Ok(())
    }
}

fn set_rlimit(resource: Resource, soft: rlim_t, hard: rlim_t) -> Result<(), c_int> {
    let limit = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };
    // SAFETY: `limit` is a valid rlimit and `resource` one of libc's constants.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(super::child::errno());
    }
    Ok(())
}
