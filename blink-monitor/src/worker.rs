use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::{Error, Result};

/// Upper bound on the time a worker sleeping through its interval takes to
/// notice a stop request.
pub(crate) const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

const DONE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep for `dur` or until `flag` is stopped, whichever comes first.
///
/// Returns `true` if the flag is still alive afterwards.
pub(crate) fn sleep_while_alive(flag: &thread_control::Flag, dur: Duration) -> bool {
    let deadline = Instant::now() + dur;
    loop {
        if !flag.is_alive() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
    }
}

/// A named worker thread which can be stopped cooperatively.
pub(crate) struct ControlledJoinHandle<T> {
    name: &'static str,
    control: thread_control::Control,
    join_handle: std::thread::JoinHandle<T>,
    /// How long the worker may take to exit before this is reported as a
    /// shutdown timeout.
    stop_bound: Duration,
}

/// Spawn `f` on a new thread named `name`. `f` must return soon after the
/// flag it receives is no longer alive.
pub(crate) fn spawn_controlled<T, F>(
    name: &'static str,
    stop_bound: Duration,
    f: F,
) -> Result<ControlledJoinHandle<T>>
where
    F: FnOnce(thread_control::Flag) -> T + Send + 'static,
    T: Send + 'static,
{
    let (flag, control) = thread_control::make_pair();
    let join_handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || f(flag))
        .map_err(Error::ThreadSpawn)?;
    Ok(ControlledJoinHandle {
        name,
        control,
        join_handle,
        stop_bound,
    })
}

impl<T> ControlledJoinHandle<T> {
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the worker to stop and block until its thread has exited.
    ///
    /// This never gives up waiting. If the worker exceeds its stop bound, a
    /// [Error::ShutdownTimeout] is logged once and waiting continues.
    pub(crate) fn close_and_join(self) -> Result<T> {
        debug!(
            "sending stop {:?} {:?}",
            self.join_handle.thread().name(),
            self.join_handle.thread().id()
        );
        self.control.stop();
        let start = Instant::now();
        let mut timeout_reported = false;
        while !self.control.is_done() {
            if !timeout_reported && start.elapsed() > self.stop_bound {
                let e = Error::ShutdownTimeout {
                    worker: self.name.to_string(),
                    waited: start.elapsed(),
                };
                error!(critical = true, "{e}; a blocking call is probably stuck");
                timeout_reported = true;
            }
            std::thread::sleep(DONE_POLL_INTERVAL);
        }
        debug!(
            "joining {:?} {:?}",
            self.join_handle.thread().name(),
            self.join_handle.thread().id()
        );
        let result = self
            .join_handle
            .join()
            .map_err(|_| Error::WorkerPanicked(self.name.to_string()));
        debug!("joining done");
        result
    }
}
