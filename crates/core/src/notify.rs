//! Versioned notifiers: the wait primitives of the cooperative core.
//!
//! A [`Notifier`] is a monotonic `u64` plus the set of tasks waiting for it
//! to cross a threshold; a [`Flag`] is its one-shot boolean cousin. Both
//! are thin wrappers over `tokio::sync::watch`, which gives us threshold
//! waits without lost wakeups.

use tokio::sync::watch;

/// A monotonically increasing value with threshold waits.
#[derive(Debug)]
pub struct Notifier {
    tx: watch::Sender<u64>,
}

impl Notifier {
    pub fn new(initial: u64) -> Self {
        Self {
            tx: watch::channel(initial).0,
        }
    }

    pub fn get(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Set the value to `val`, waking every waiter whose threshold is now
    /// reached. Monotonicity is on the caller; going backwards is a bug.
    pub fn set(&self, val: u64) {
        self.tx.send_modify(|v| {
            debug_assert!(val >= *v, "notifier moved backwards: {val} < {v}");
            *v = val;
        });
    }

    /// Advance to `max(current, val)`.
    pub fn advance_to(&self, val: u64) {
        self.tx.send_modify(|v| *v = (*v).max(val));
    }

    /// Add `delta` to the current value.
    pub fn add(&self, delta: u64) {
        if delta > 0 {
            self.tx.send_modify(|v| *v += delta);
        }
    }

    /// Suspend until the value is at least `target`.
    pub async fn wait_for(&self, target: u64) {
        if self.get() >= target {
            return;
        }
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail.
        let _ = rx.wait_for(|v| *v >= target).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// A one-way boolean: unset at creation, set at most once, with waits.
#[derive(Debug)]
pub struct Flag {
    tx: watch::Sender<bool>,
}

impl Flag {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set(&self) {
        self.tx.send_modify(|v| *v = true);
    }

    /// Suspend until the flag is set.
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_resumes_on_threshold() {
        let notifier = std::sync::Arc::new(Notifier::new(0));

        let waiter = {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                notifier.wait_for(3).await;
                notifier.get()
            })
        };

        notifier.set(1);
        notifier.set(2);
        assert!(!waiter.is_finished());
        notifier.set(3);
        assert!(waiter.await.unwrap() >= 3);
    }

    #[tokio::test]
    async fn wait_for_already_reached_returns_immediately() {
        let notifier = Notifier::new(10);
        notifier.wait_for(5).await;
    }

    #[tokio::test]
    async fn flag_wakes_waiters() {
        let flag = std::sync::Arc::new(Flag::new());
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };
        flag.set();
        waiter.await.unwrap();
        assert!(flag.is_set());
    }
}
