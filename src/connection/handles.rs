// ============================================================================
// Handles counter
// ============================================================================
//
// Reference/backpressure primitive used for drain-before-suspend and
// drain-before-close. Every zero-crossing wakes all registered idle waiters
// once; waiters registered while the count is already zero resolve at once.
//
// ============================================================================

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{Level, event};

#[derive(Default)]
pub struct Handles {
    inner: Mutex<HandlesInner>,
}

#[derive(Default)]
struct HandlesInner {
    count: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Handles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        let mut inner = self.lock();
        inner.count += 1;
    }

    /// Decrement the count. At zero every pending idle waiter is woken once.
    /// A decrement at zero is ignored.
    pub fn dec(&self) {
        let waiters = {
            let mut inner = self.lock();
            if inner.count == 0 {
                drop(inner);
                event!(Level::WARN, "handles decremented below zero; ignoring");
                return;
            }
            inner.count -= 1;
            if inner.count > 0 {
                return;
            }
            std::mem::take(&mut inner.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    pub fn count(&self) -> usize {
        self.lock().count
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Resolves immediately when idle, otherwise on the next zero-crossing.
    pub async fn idle(&self) {
        let rx = {
            let mut inner = self.lock();
            if inner.count == 0 {
                return;
            }
            // Waiters whose idle() future was dropped.
            inner.waiters.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Increment and return a guard that decrements on drop.
    pub fn enter(self: &Arc<Self>) -> HandleGuard {
        self.inc();
        HandleGuard {
            handles: Arc::clone(self),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandlesInner> {
        // The counter holds no invariant a panicking holder could break halfway.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Handles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handles").field("count", &self.count()).finish()
    }
}

/// RAII increment of a [`Handles`] counter.
pub struct HandleGuard {
    handles: Arc<Handles>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.handles.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_idle_when_zero_resolves_immediately() {
        let handles = Handles::new();
        let mut idle = task::spawn(handles.idle());
        assert_ready!(idle.poll());
    }

    #[test]
    fn test_idle_resolves_on_zero_crossing() {
        let handles = Handles::new();
        handles.inc();
        handles.inc();

        let mut idle = task::spawn(handles.idle());
        assert_pending!(idle.poll());

        handles.dec();
        assert_pending!(idle.poll());

        handles.dec();
        assert!(idle.is_woken());
        assert_ready!(idle.poll());
    }

    #[test]
    fn test_dec_never_goes_negative() {
        let handles = Handles::new();
        handles.dec();
        assert_eq!(handles.count(), 0);
        handles.inc();
        assert_eq!(handles.count(), 1);
    }

    #[test]
    fn test_waiters_fire_once_per_crossing() {
        let handles = Handles::new();
        handles.inc();
        let mut first = task::spawn(handles.idle());
        assert_pending!(first.poll());
        handles.dec();
        assert_ready!(first.poll());

        handles.inc();
        let mut second = task::spawn(handles.idle());
        assert_pending!(second.poll());
        handles.inc();
        handles.dec();
        assert_pending!(second.poll());
        handles.dec();
        assert_ready!(second.poll());
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let handles = Handles::new();
        handles.inc();

        for _ in 0..10 {
            let mut abandoned = task::spawn(handles.idle());
            assert_pending!(abandoned.poll());
        }
        let mut live = task::spawn(handles.idle());
        assert_pending!(live.poll());
        assert_eq!(handles.lock().waiters.len(), 1);

        handles.dec();
        assert_ready!(live.poll());
    }

    #[test]
    fn test_guard_decrements_on_drop() {
        let handles = Arc::new(Handles::new());
        let guard = handles.enter();
        assert_eq!(handles.count(), 1);
        drop(guard);
        assert!(handles.is_idle());
    }
}
