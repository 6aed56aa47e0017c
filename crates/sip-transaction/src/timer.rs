//! Timer/Scheduler façade.
//!
//! The state machines in this crate never call `tokio::time::sleep`
//! directly; they go through a [`Scheduler`], which threads a caller-
//! supplied lock into every callback. This is the rule that makes the
//! transaction and UA state machines safe to reason about: a timer
//! callback always observes a consistent view of the state it mutates,
//! because it runs under the same lock every other mutator holds.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The per-UA mutual-exclusion lock threaded through every timer callback
/// and every inbound-message dispatch for that UA. Holds no data of its
/// own; it exists purely for mutual exclusion.
#[derive(Debug, Default)]
pub struct SessionLock(Mutex<()>);

impl SessionLock {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionLock(Mutex::new(())))
    }

    /// Run `f` with the lock held. Re-entrant calls from the same thread
    /// will deadlock, matching a plain non-reentrant mutex.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.0.lock();
        f()
    }
}

/// A handle to a scheduled one-shot timer. Cancellation is idempotent: a
/// timer that already fired, or whose callback is already queued, treats a
/// `cancel()` as a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// One-shot callback scheduler, consumed (not implemented) by the core.
/// [`TokioScheduler`] is the only implementation shipped here; applications
/// embedding this crate without tokio would supply their own.
pub trait Scheduler: Send + Sync + 'static {
    /// Arm a one-shot timer. `callback` runs under `lock` once `delay` has
    /// elapsed, unless cancelled first. The callback MUST re-check whatever
    /// state it closes over before acting, since a race between firing and
    /// cancellation can still deliver a stale callback under the lock.
    fn start_timeout(
        &self,
        delay: Duration,
        lock: Arc<SessionLock>,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimerHandle;
}

/// `tokio::time`-backed scheduler. Spawns a detached task per timer;
/// cancellation is checked both before and after acquiring `lock` so a
/// callback racing a concurrent cancel observes it and returns without
/// effect.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn start_timeout(
        &self,
        delay: Duration,
        lock: Arc<SessionLock>,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TimerHandle {
            cancelled: cancelled.clone(),
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if cancelled.load(Ordering::SeqCst) {
                return;
            }

            lock.with_lock(|| {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }

                callback();
            });
        });

        handle
    }
}

/// Boxed future alias used where the scheduler needs to await something
/// async-native (transport sends) from inside a synchronous callback body.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
