//! Keyed one-shot timers over the tokio runtime
//!
//! Each timer is a spawned task sleeping until its deadline. Cancellation
//! is idempotent and wins races with firing: whichever side removes the
//! timer id from the shared map first decides whether the callback runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;

pub type TimerId = u64;

struct Inner {
    timers: Mutex<HashMap<TimerId, oneshot::Sender<()>>>,
    next_id: AtomicU64,
}

/// Shared handle to the timer table; cheap to clone
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Schedule `cb` to run once after `delay`
    pub fn schedule<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        // Registered before the task spawns so cancel can never miss it
        self.inner.timers.lock().unwrap().insert(id, cancel_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {
                    // Winning this removal means we were not cancelled
                    if inner.timers.lock().unwrap().remove(&id).is_some() {
                        cb();
                    }
                }
                _ = cancel_rx => {}
            }
        });

        id
    }

    /// Schedule a callback that only fires while `owner` is still alive
    pub fn schedule_guarded<T, F>(&self, delay: Duration, owner: &Arc<T>, cb: F) -> TimerId
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(owner);
        self.schedule(delay, move || {
            if let Some(owner) = weak.upgrade() {
                cb(owner);
            }
        })
    }

    /// Cancel a timer; true iff it had not yet fired or been cancelled
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.timers.lock().unwrap().remove(&id).is_some()
    }

    /// Cancel every outstanding timer
    pub fn cancel_all(&self) {
        self.inner.timers.lock().unwrap().clear();
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn active_count(&self) -> usize {
        self.inner.timers.lock().unwrap().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
