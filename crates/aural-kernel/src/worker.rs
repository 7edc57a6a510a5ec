//! Background worker threads.
//!
//! The engine runs two named threads, one draining the command queue and one
//! pumping streams. Each parks on a [`Signal`] between passes. A notify that
//! arrives while the worker is busy is remembered, so the next wait returns
//! immediately instead of sleeping through queued work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{SoundError, SoundResult};

/// Interval at which shutdown polls for a worker to finish.
const JOIN_POLL: Duration = Duration::from_millis(2);

/// Wake-up flag with a timed wait.
#[derive(Debug, Default)]
pub struct Signal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    /// Create an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiter, or make its next wait return at once.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.condvar.notify_one();
    }

    /// Park until notified or until `timeout` elapses.
    ///
    /// Returns `true` when woken by a notify.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let deadline = Instant::now().checked_add(timeout);
            match deadline {
                Some(deadline) => {
                    while !*pending {
                        if self.condvar.wait_until(&mut pending, deadline).timed_out() {
                            break;
                        }
                    }
                },
                None => {
                    while !*pending {
                        self.condvar.wait(&mut pending);
                    }
                },
            }
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// A named background thread with a cooperative kill flag.
#[derive(Debug)]
pub struct Worker {
    name: String,
    signal: Arc<Signal>,
    kill: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker.
    ///
    /// `body` receives the worker's signal and kill flag and must return once
    /// the flag is set.
    pub fn spawn<F>(name: &str, signal: Arc<Signal>, body: F) -> SoundResult<Self>
    where
        F: FnOnce(Arc<Signal>, Arc<AtomicBool>) + Send + 'static,
    {
        let kill = Arc::new(AtomicBool::new(false));
        let handle = {
            let signal = Arc::clone(&signal);
            let kill = Arc::clone(&kill);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || body(signal, kill))?
        };
        debug!("Spawned worker '{}'", name);
        Ok(Self {
            name: name.to_string(),
            signal,
            kill,
            handle: Some(handle),
        })
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake the worker.
    pub fn notify(&self) {
        self.signal.notify();
    }

    /// Whether the thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the worker to exit and wait up to `timeout` for it.
    ///
    /// A worker that does not exit in time is detached and reported.
    pub fn shutdown(&mut self, timeout: Duration) -> SoundResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.kill.store(true, Ordering::Release);
        self.signal.notify();

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                error!("Worker '{}' did not exit within {:?}", self.name, timeout);
                return Err(SoundError::ShutdownTimeout {
                    thread: self.name.clone(),
                });
            }
            thread::sleep(JOIN_POLL);
        }

        if handle.join().is_err() {
            error!("Worker '{}' panicked", self.name);
        } else {
            debug!("Worker '{}' stopped", self.name);
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.shutdown(Duration::from_secs(1));
        }
    }
}

/// Whether a worker has been told to exit.
#[must_use]
pub fn killed(kill: &AtomicBool) -> bool {
    kill.load(Ordering::Acquire)
}
