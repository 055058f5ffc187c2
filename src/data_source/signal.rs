//! Small synchronization primitives shared between a data source thread and its owner.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Latch<T> {
    value: Mutex<Option<T>>,
    changed: Condvar,
}

impl<T: Clone> Latch<T> {
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the value unless one is already set; returns whether this call set it.
    fn set(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.changed.notify_all();
        true
    }

    fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    fn wait(&self, timeout: Duration) -> Option<T> {
        let slot = self.lock();
        let (slot, _) = self
            .changed
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }
}

/// Cooperative cancellation for long-running data source work.
///
/// Clones share the same state; cancelling any clone cancels all of them. Cancellation cannot be
/// undone.
#[derive(Clone, Debug, Default)]
pub struct LifetimeToken {
    latch: Arc<Latch<()>>,
}

impl LifetimeToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.latch.set(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.latch.get().is_some()
    }

    /// Sleeps for up to `timeout`, waking early on cancellation. Returns whether the token is
    /// cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait(timeout).is_some()
    }
}

/// Completes once, when a data source either becomes ready or gives up.
#[derive(Clone, Debug, Default)]
pub struct ReadySignal {
    latch: Arc<Latch<bool>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the signal. Later calls are ignored; returns whether this call completed it.
    pub(crate) fn complete(&self, ready: bool) -> bool {
        self.latch.set(ready)
    }

    /// None until the signal completes, then whether the source became ready.
    pub fn outcome(&self) -> Option<bool> {
        self.latch.get()
    }

    /// Blocks up to `timeout` for the signal to complete.
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        self.latch.wait(timeout)
    }
}
