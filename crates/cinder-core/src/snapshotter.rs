//! Periodic snapshot worker.
//!
//! A single thread that sleeps for the configured interval and then
//! asks the storage engine to save a snapshot. The worker observes a
//! stop flag through a condvar so shutdown is prompt; [`Snapshotter::stop`]
//! joins the thread before returning and is safe to call repeatedly.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::storage::Storage;

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the background snapshot thread.
pub struct Snapshotter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Snapshotter {
    /// Spawns the worker. It writes its first snapshot one `interval`
    /// after start, then every `interval` thereafter.
    pub fn start(storage: Arc<Storage>, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || run(storage, worker_shared, interval));
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Signals the worker and joins it. Idempotent.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        *self
            .shared
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.wake.notify_all();
        let _ = worker.join();
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(storage: Arc<Storage>, shared: Arc<Shared>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "background snapshotter started");
    loop {
        if sleep_until_stopped(&shared, interval) {
            break;
        }
        if storage.save_snapshot() {
            debug!("periodic snapshot written");
        }
    }
    info!("background snapshotter stopped");
}

/// Sleeps for `timeout` on the condvar. Returns true if stop was
/// requested before the timeout elapsed.
fn sleep_until_stopped(shared: &Shared, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut stop = shared
        .stop
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    while !*stop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let (guard, _) = shared
            .wake
            .wait_timeout(stop, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        stop = guard;
    }
    true
}
