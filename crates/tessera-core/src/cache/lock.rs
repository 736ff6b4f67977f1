//! Named, expiring advisory locks.
//!
//! A lock is held until its guard is dropped or its expiry passes. Waiters on
//! an expired lock take it over; the previous holder's release then becomes a
//! no-op because its token no longer matches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

/// Far-future fallback when `now + expire` overflows.
const MAX_EXPIRY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

struct LockRecord {
    token: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct LockTable {
    held: Mutex<FxHashMap<String, LockRecord>>,
    released: Notify,
    next_token: AtomicU64,
}

impl LockTable {
    fn held(&self) -> MutexGuard<'_, FxHashMap<String, LockRecord>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock, or return the current holder's expiry.
    fn try_take(self: &Arc<Self>, name: &str, expire: Duration) -> Result<LockGuard, Instant> {
        let now = Instant::now();
        let mut held = self.held();

        if let Some(record) = held.get(name) {
            if record.expires_at > now {
                return Err(record.expires_at);
            }
            tracing::warn!("Lock {} expired while held; taking it over", name);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let expires_at = now
            .checked_add(expire)
            .unwrap_or_else(|| now + MAX_EXPIRY);
        held.insert(name.to_string(), LockRecord { token, expires_at });

        Ok(LockGuard {
            table: Arc::clone(self),
            name: name.to_string(),
            token,
        })
    }
}

/// A table of advisory locks shared by everyone holding a clone.
#[derive(Clone, Default)]
pub struct AdvisoryLocks {
    table: Arc<LockTable>,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `name`, waiting for the current holder to release it or for
    /// its expiry to pass.
    pub async fn acquire(&self, name: &str, expire: Duration) -> LockGuard {
        loop {
            let released = self.table.released.notified();
            tokio::pin!(released);
            // Register before checking, so a release between the check and
            // the await still wakes us.
            released.as_mut().enable();

            let holder_expiry = match self.table.try_take(name, expire) {
                Ok(guard) => return guard,
                Err(expires_at) => expires_at,
            };

            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep_until(holder_expiry.into()) => {}
            }
        }
    }

    /// Acquire `name` only if it's free or expired.
    pub fn try_acquire(&self, name: &str, expire: Duration) -> Option<LockGuard> {
        self.table.try_take(name, expire).ok()
    }

    /// Whether `name` is currently held and unexpired.
    pub fn is_locked(&self, name: &str) -> bool {
        self.table
            .held()
            .get(name)
            .is_some_and(|record| record.expires_at > Instant::now())
    }
}

/// Ownership of an advisory lock. Dropping it releases the lock.
pub struct LockGuard {
    table: Arc<LockTable>,
    name: String,
    token: u64,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this guard still owns the lock (it hasn't been taken over).
    pub fn is_held(&self) -> bool {
        self.table
            .held()
            .get(&self.name)
            .is_some_and(|record| record.token == self.token)
    }

    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.table.held();
        let owned = held
            .get(&self.name)
            .is_some_and(|record| record.token == self.token);
        if owned {
            held.remove(&self.name);
        }
        drop(held);
        if owned {
            self.table.released.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_exclusive() {
        let locks = AdvisoryLocks::new();
        let guard = locks.acquire("a", Duration::from_secs(60)).await;
        assert!(locks.is_locked("a"));
        assert!(locks.try_acquire("a", Duration::from_secs(60)).is_none());
        assert!(locks.try_acquire("b", Duration::from_secs(60)).is_some());

        drop(guard);
        assert!(!locks.is_locked("a"));
        assert!(locks.try_acquire("a", Duration::from_secs(60)).is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = AdvisoryLocks::new();
        let guard = locks.acquire("k", Duration::from_secs(60)).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("k", Duration::from_secs(60)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let locks = AdvisoryLocks::new();
        let stale = locks.acquire("k", Duration::from_millis(30)).await;

        let fresh = tokio::time::timeout(
            Duration::from_secs(2),
            locks.acquire("k", Duration::from_secs(60)),
        )
        .await
        .expect("expired lock should be taken over");

        assert!(!stale.is_held());
        assert!(fresh.is_held());

        // The stale holder's release must not free the new holder's lock.
        drop(stale);
        assert!(locks.is_locked("k"));
        drop(fresh);
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let locks = AdvisoryLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _guard = locks.acquire("shared", Duration::from_secs(60)).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
