//! Destruction deferral drivers.
//!
//! A node with `Ttl::After` or `Ttl::Until` is not destroyed when its last
//! observer leaves. The engine arms exactly one deferral instead and keeps the
//! returned [`CancelHandle`]; a new observer cancels it, otherwise the
//! deferral fires and the node is destroyed.
//!
//! The concrete primitive is injected: [`Timer`] for delays (the ecosystem
//! defaults to [`TokioTimer`]) and [`DeferralSignal`] for external completion.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::warn;

/// Work run when a deferral fires.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Cancels an armed deferral.
///
/// Clones share the same state: implementations keep a clone and check
/// [`is_cancelled`](Self::is_cancelled) before firing.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort a spawned task on cancellation as well.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Runs a callback after a delay.
pub trait Timer: Send + Sync {
    fn schedule(&self, delay: Duration, callback: Callback) -> CancelHandle;
}

/// Runs a callback once some external work settles.
pub trait DeferralSignal: Send + Sync {
    fn subscribe(&self, callback: Callback) -> CancelHandle;
}

/// Timer backed by the ambient tokio runtime.
///
/// Without a runtime there is nothing to drive the delay, so the callback
/// fires immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: Callback) -> CancelHandle {
        let handle = CancelHandle::new();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let token = handle.clone();
                let task = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !token.is_cancelled() {
                        callback();
                    }
                });
                handle.with_abort(task.abort_handle())
            }
            Err(_) => {
                warn!(?delay, "no tokio runtime available, firing deferral immediately");
                callback();
                handle
            }
        }
    }
}

struct PendingTimer {
    deadline: Duration,
    handle: CancelHandle,
    callback: Callback,
}

/// Deterministic timer advanced by hand.
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    pending: Vec<PendingTimer>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of armed, uncancelled timers.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .count()
    }

    /// Move time forward, firing every due timer in deadline order.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;
            let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|timer| timer.deadline <= now);
            state.pending = pending;
            due.sort_by_key(|timer| timer.deadline);
            due
        };
        // callbacks may arm new timers
        for timer in due {
            if !timer.handle.is_cancelled() {
                (timer.callback)();
            }
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, callback: Callback) -> CancelHandle {
        let handle = CancelHandle::new();
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.pending.push(PendingTimer {
            deadline,
            handle: handle.clone(),
            callback,
        });
        handle
    }
}

/// A one-shot signal that can be fired by hand.
#[derive(Clone, Default)]
pub struct Trigger {
    state: Arc<Mutex<TriggerState>>,
}

#[derive(Default)]
struct TriggerState {
    fired: bool,
    waiting: Vec<(CancelHandle, Callback)>,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Settle the signal, running every uncancelled subscriber.
    pub fn fire(&self) {
        let waiting = {
            let mut state = self.state.lock();
            state.fired = true;
            std::mem::take(&mut state.waiting)
        };
        for (handle, callback) in waiting {
            if !handle.is_cancelled() {
                callback();
            }
        }
    }
}

impl DeferralSignal for Trigger {
    fn subscribe(&self, callback: Callback) -> CancelHandle {
        let handle = CancelHandle::new();
        let mut state = self.state.lock();
        if state.fired {
            drop(state);
            callback();
        } else {
            state.waiting.push((handle.clone(), callback));
        }
        handle
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("fired", &self.is_fired())
            .finish()
    }
}
