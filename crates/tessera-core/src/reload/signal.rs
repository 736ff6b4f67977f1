//! Repeatable multi-waiter signal.

use std::sync::Arc;

use tokio::sync::watch;

/// A broadcast signal that can fire any number of times.
///
/// Each firing bumps a generation counter. A waiter only returns for a firing
/// that happens after it started waiting, so a late waiter never sees an old
/// firing as already satisfied.
#[derive(Debug, Clone)]
pub struct ReloadSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for ReloadSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Wake every current waiter. Returns the new generation.
    pub fn fire(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|g| {
            *g += 1;
            generation = *g;
        });
        generation
    }

    /// Wake every current waiter, reporting `generation`.
    ///
    /// The reported value never goes backwards: a `generation` not above the
    /// current one is bumped past it. Returns the value waiters see.
    pub fn fire_at(&self, generation: u64) -> u64 {
        let mut fired = 0;
        self.tx.send_modify(|g| {
            *g = generation.max(*g + 1);
            fired = *g;
        });
        fired
    }

    /// Generation of the latest firing, 0 before the first.
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Wait for the next firing after this call. Returns its generation.
    ///
    /// Cancel-safe: dropping the future has no effect on the signal.
    pub fn wait(&self) -> impl Future<Output = u64> + Send + 'static {
        let mut waiter = self.subscribe();
        async move { waiter.next().await }
    }

    /// A waiter that observes every firing after this call, one at a time.
    pub fn subscribe(&self) -> ReloadWaiter {
        let mut rx = self.tx.subscribe();
        rx.borrow_and_update();
        ReloadWaiter { rx }
    }
}

/// Subscription to a [`ReloadSignal`].
#[derive(Debug)]
pub struct ReloadWaiter {
    rx: watch::Receiver<u64>,
}

impl ReloadWaiter {
    /// Wait for a firing not yet observed by this waiter.
    ///
    /// Several firings in quick succession may be observed as one.
    pub async fn next(&mut self) -> u64 {
        // The sender lives as long as the signal; a closed channel means the
        // signal is gone and can never fire again.
        if self.rx.changed().await.is_err() {
            return std::future::pending().await;
        }
        *self.rx.borrow_and_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wakes_all_waiters() {
        let signal = ReloadSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let mut waiter = signal.subscribe();
                tokio::spawn(async move { waiter.next().await })
            })
            .collect();

        assert_eq!(signal.fire(), 1);
        for waiter in waiters {
            let generation = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(generation, 1);
        }
    }

    #[tokio::test]
    async fn test_late_waiter_does_not_see_old_firing() {
        let signal = ReloadSignal::new();
        signal.fire();

        let late = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(late.is_err(), "late waiter returned for an earlier firing");

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(signal.fire(), 2);
        assert_eq!(waiter.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_wait_has_no_effect() {
        let signal = ReloadSignal::new();
        {
            let wait = signal.wait();
            let _ = tokio::time::timeout(Duration::from_millis(10), wait).await;
        }
        assert_eq!(signal.generation(), 0);
        assert_eq!(signal.fire(), 1);
        assert_eq!(signal.generation(), 1);
    }

    #[tokio::test]
    async fn test_fire_at_reports_given_generation() {
        let signal = ReloadSignal::new();
        let mut waiter = signal.subscribe();

        assert_eq!(signal.fire_at(3), 3);
        assert_eq!(waiter.next().await, 3);

        // Never moves backwards.
        assert_eq!(signal.fire_at(2), 4);
        assert_eq!(waiter.next().await, 4);
        assert_eq!(signal.fire(), 5);
    }

    #[tokio::test]
    async fn test_waiter_observes_successive_firings() {
        let signal = ReloadSignal::new();
        let mut waiter = signal.subscribe();

        signal.fire();
        assert_eq!(waiter.next().await, 1);
        signal.fire();
        assert_eq!(waiter.next().await, 2);
    }
}
