use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stop flag a sleeping worker can be woken by
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cvar.notify_all();
    }

    /// Sleep up to `timeout`; true once stop was requested
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cvar.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Background thread running a closure every `interval` until stopped.
///
/// The closure returns `false` to end the loop on its own.
pub struct Ticker {
    signal: Arc<StopSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let worker_signal = Arc::clone(&signal);
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("{} started (interval={:?})", thread_name, interval);
            while !worker_signal.wait(interval) {
                if !tick() {
                    break;
                }
            }
            debug!("{} stopped", thread_name);
        })?;

        Ok(Self {
            signal,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the thread and wait up to `timeout` for it to exit.
    ///
    /// Returns true when the thread was joined. Called from the worker thread
    /// itself it only signals.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.signal.stop();

        let Some(handle) = self.handle.lock().take() else {
            return false;
        };
        if handle.thread().id() == thread::current().id() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Worker {:?} did not stop within {:?}, detaching",
                    handle.thread().name(),
                    timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        handle.join().is_ok()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(5));
    }
}
