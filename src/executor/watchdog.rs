use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    /// Set once the child is known to have terminated (still unreaped)
    child_done: bool,
    fired: bool,
}

/// Kills the child with `SIGKILL` once a wall-clock deadline passes
///
/// The controller must call [`Watchdog::disarm`] after observing the child's
/// termination with `WNOWAIT` and before reaping it: as long as the child is
/// an unreaped zombie its pid cannot be recycled, so the kill can never hit
/// an unrelated process. Dropping the watchdog stops it the same way, so an
/// early return can never leave a live timer behind.
pub(super) struct Watchdog {
    shared: Arc<(Mutex<State>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(super) fn arm(pid: libc::pid_t, limit: Duration) -> io::Result<Self> {
        let shared = Arc::new((Mutex::new(State::default()), Condvar::new()));
        let deadline = Instant::now() + limit;

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("watchdog-{pid}"))
            .spawn(move || {
                let (lock, condvar) = &*thread_shared;
                let mut state = lock.lock();
                while !state.child_done {
                    if condvar.wait_until(&mut state, deadline).timed_out() {
                        if !state.child_done {
                            log::info!(
                                "Process {pid} exceeded wall time limit of {:.2}s, killing",
                                limit.as_secs_f64()
                            );
                            // SAFETY: plain syscall; the pid is unreaped, see type docs.
                            unsafe { libc::kill(pid, libc::SIGKILL) };
                            state.fired = true;
                        }
                        break;
                    }
                }
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Stops the watchdog and reports whether it killed the child
    pub(super) fn disarm(mut self) -> bool {
        self.stop();
        self.shared.0.lock().fired
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        {
            let (lock, condvar) = &*self.shared;
            let mut state = lock.lock();
            state.child_done = true;
            condvar.notify_one();
        }

        if handle.join().is_err() {
            log::error!("Watchdog thread panicked");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
