//! Concurrency primitives shared by the reporter and the traffic threads.
//!
//! - [`Monitor`]: a mutex bound 1:1 to a condition variable
//! - [`ThreadRegistry`]: live-thread bookkeeping with `join_all`
//! - [`Backoff`]: the bounded spin/yield/sleep ladder used wherever a
//!   producer waits on the reporter

use crate::{Error, Result};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Mutex plus condition variable (monitor pattern).
#[derive(Debug, Default)]
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    /// Releases the lock, sleeps until signalled, reacquires it.
    pub fn wait(&self, guard: &mut MutexGuard<'_, T>) {
        self.cond.wait(guard);
    }

    /// Like [`Monitor::wait`] but gives up after `timeout`. Returns `true` on timeout.
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.cond.wait_for(guard, timeout).timed_out()
    }

    /// Waits until `condition` returns `false`, re-checking after every wakeup.
    pub fn wait_while<F>(&self, guard: &mut MutexGuard<'_, T>, condition: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.cond.wait_while(guard, condition);
    }

    /// Wakes one waiter.
    pub fn signal(&self) -> bool {
        self.cond.notify_one()
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) -> usize {
        self.cond.notify_all()
    }
}

#[derive(Debug, Default)]
struct ThreadCounts {
    live: usize,
    non_terminating: usize,
}

/// Counts the threads `join_all` has to wait for.
///
/// Two escape hatches keep shutdown possible: a thread that knows it may be
/// abandoned (the reporter while parked) excludes itself from the count, and
/// threads that block indefinitely (acceptors) register as non-terminating
/// so an interrupt can release them from the count in one step.
///
/// # Examples
///
/// ```
/// use rperf_reporter::sync::ThreadRegistry;
/// use std::sync::Arc;
///
/// let registry = Arc::new(ThreadRegistry::new());
/// let handle = registry.spawn("worker", || 40 + 2).unwrap();
///
/// registry.join_all();
/// assert_eq!(registry.live(), 0);
/// assert_eq!(handle.join().unwrap(), 42);
/// ```
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    counts: Monitor<ThreadCounts>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.counts.lock().live += 1;
    }

    pub fn decrement(&self) {
        let mut counts = self.counts.lock();
        counts.live = counts.live.saturating_sub(1);
        self.counts.broadcast();
    }

    /// Number of threads `join_all` is currently waiting for.
    pub fn live(&self) -> usize {
        self.counts.lock().live
    }

    /// Blocks until the live count reaches zero.
    pub fn join_all(&self) {
        let mut counts = self.counts.lock();
        self.counts.wait_while(&mut counts, |c| c.live > 0);
    }

    /// Like [`ThreadRegistry::join_all`], bounded by `timeout`. Returns `true` if everyone finished.
    pub fn join_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock();
        while counts.live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.counts.wait_for(&mut counts, deadline - now);
        }
        true
    }

    /// Lets `join_all` complete without the calling thread.
    pub fn exclude_from_join(&self) {
        self.decrement();
    }

    /// Undoes [`ThreadRegistry::exclude_from_join`].
    pub fn include_in_join(&self) {
        let mut counts = self.counts.lock();
        counts.live += 1;
        self.counts.broadcast();
    }

    pub fn register_non_terminating(&self) {
        self.counts.lock().non_terminating += 1;
    }

    pub fn unregister_non_terminating(&self) {
        let mut counts = self.counts.lock();
        if counts.non_terminating == 0 {
            // Already released; the caller's own exit decrements the live
            // count, so it has to be counted again.
            counts.live += 1;
        } else {
            counts.non_terminating -= 1;
        }
    }

    /// Marks the calling thread non-terminating until the guard drops.
    pub fn non_terminating(self: &Arc<Self>) -> NonTerminatingGuard {
        self.register_non_terminating();
        NonTerminatingGuard {
            registry: Arc::clone(self),
        }
    }

    /// Removes every non-terminating thread from the live count so
    /// `join_all` can finish once the terminating ones are done.
    ///
    /// Returns the remaining live count.
    pub fn release_non_terminating(&self, interrupt: bool) -> usize {
        let mut counts = self.counts.lock();
        let released = counts.non_terminating;
        counts.live = counts.live.saturating_sub(released);
        if interrupt && released > 0 && counts.live > 1 {
            warn!("Waiting for server threads to complete. Interrupt again to force quit.");
        }
        counts.non_terminating = 0;
        self.counts.broadcast();
        debug!("released {} non-terminating threads, {} remain", released, counts.live);
        counts.live
    }

    /// Spawns a named thread counted until `f` returns or panics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thread`] if the OS refuses to create the thread.
    pub fn spawn<F, T>(self: &Arc<Self>, name: &str, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.increment();
        let registry = Arc::clone(self);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _live = LiveGuard { registry };
            f()
        });
        spawned.map_err(|e| {
            self.decrement();
            Error::Thread(format!("failed to spawn {}: {}", name, e))
        })
    }
}

struct LiveGuard {
    registry: Arc<ThreadRegistry>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.registry.decrement();
    }
}

/// Returned by [`ThreadRegistry::non_terminating`].
pub struct NonTerminatingGuard {
    registry: Arc<ThreadRegistry>,
}

impl Drop for NonTerminatingGuard {
    fn drop(&mut self) {
        self.registry.unregister_non_terminating();
    }
}

const YIELD_LIMIT: u32 = 10;
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Wait ladder for producer-side stalls: yield first, then sleep with
/// exponentially growing naps capped at 1 ms.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snooze(&mut self) {
        if self.step < YIELD_LIMIT {
            thread::yield_now();
        } else {
            let shift = (self.step - YIELD_LIMIT).min(10);
            let nap = Duration::from_micros(1u64 << shift).min(MAX_SLEEP);
            thread::sleep(nap);
        }
        self.step = self.step.saturating_add(1);
    }

    /// Whether the ladder has moved past plain yielding.
    pub fn is_sleeping(&self) -> bool {
        self.step >= YIELD_LIMIT
    }

    pub fn steps(&self) -> u32 {
        self.step
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}
