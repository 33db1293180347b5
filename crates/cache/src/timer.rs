//! Background cleanup timer
//!
//! A single named thread calls a tick function at a fixed interval until it
//! is stopped or the tick reports that there is nothing left to clean.

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Name of the cleanup thread
pub const CLEANUP_THREAD_NAME: &str = "object-cache-cleanup";

/// Shortest accepted interval, so a zero interval cannot spin
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running cleanup thread.
///
/// Dropping the handle signals the thread to stop without waiting for it;
/// [`CleanupTimer::stop`] also waits.
pub struct CleanupTimer {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
}

impl CleanupTimer {
    /// Start calling `tick` every `interval`
    ///
    /// The first tick happens one interval after the start. The thread ends
    /// when `tick` returns false.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<F>(interval: Duration, tick: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let thread = thread::Builder::new()
            .name(CLEANUP_THREAD_NAME.to_string())
            .spawn(move || Self::run(interval, flag, tick))?;

        info!(?interval, "cache cleanup timer started");
        Ok(Self {
            thread: Some(thread),
            shutdown,
            interval,
        })
    }

    /// Timer loop.
    ///
    /// Parks until the next deadline so that a shutdown signal (which
    /// unparks the thread) is noticed immediately.
    fn run<F>(interval: Duration, shutdown: Arc<AtomicBool>, mut tick: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            let deadline = Instant::now() + interval;
            loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }

            if !tick() {
                debug!("cache is gone, cleanup timer exiting");
                return;
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true while the thread is alive
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the thread and wait for it to exit
    ///
    /// When called from the timer thread itself (for example by a listener
    /// reacting to an eviction) the thread is only signalled.
    pub fn stop(mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                debug!("cleanup timer stopped from its own thread");
            } else if thread.join().is_err() {
                warn!("cache cleanup thread panicked");
            }
        }
        info!("cache cleanup timer stopped");
    }

    fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }
}

impl Drop for CleanupTimer {
    fn drop(&mut self) {
        self.signal();
    }
}
