//! Per-key async mutual exclusion.
//!
//! [`KeyedMutex`] serializes operations that share a key and lets operations
//! on different keys run freely. Each held key owns an explicit FIFO queue of
//! waiters; releasing hands the lock directly to the next live waiter, and the
//! key's entry disappears once nobody holds or waits for it.
//!
//! Release happens in `Drop`, so it runs on success, on error, on panic
//! unwinding and when the holding future is cancelled.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

/// Serializes git commands that mutate one repository, keyed by its path.
pub type RepoMutex = KeyedMutex<PathBuf>;

#[derive(Default)]
struct KeyState {
    waiters: VecDeque<oneshot::Sender<()>>,
}

pub struct KeyedMutex<K> {
    keys: Arc<Mutex<HashMap<K, KeyState>>>,
}

impl<K> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
        }
    }
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> std::fmt::Debug for KeyedMutex<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("held_keys", &self.keys.lock().len())
            .finish()
    }
}

/// Held lock on one key. Dropping it releases the key.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedGuard<K: Eq + Hash> {
    keys: Arc<Mutex<HashMap<K, KeyState>>>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            release(&self.keys, key);
        }
    }
}

/// A queued waiter. If dropped after the lock was handed to it, it passes
/// the lock on instead of leaking it.
struct Ticket<K: Eq + Hash> {
    keys: Arc<Mutex<HashMap<K, KeyState>>>,
    key: Option<K>,
    rx: oneshot::Receiver<()>,
}

impl<K: Eq + Hash> Drop for Ticket<K> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            trace!("waiter cancelled after handoff, passing lock on");
            release(&self.keys, key);
        }
    }
}

fn release<K: Eq + Hash>(keys: &Mutex<HashMap<K, KeyState>>, key: K) {
    let mut map = keys.lock();
    let Some(state) = map.get_mut(&key) else {
        return;
    };
    while let Some(next) = state.waiters.pop_front() {
        if next.send(()).is_ok() {
            return;
        }
    }
    map.remove(&key);
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let rx = {
            let mut map = self.keys.lock();
            match map.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(KeyState::default());
                    None
                }
                Entry::Occupied(mut slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.get_mut().waiters.push_back(tx);
                    Some(rx)
                }
            }
        };

        if let Some(rx) = rx {
            let mut ticket = Ticket {
                keys: Arc::clone(&self.keys),
                key: Some(key.clone()),
                rx,
            };
            // The sender lives in the queue until a releaser pops it, and
            // release always sends before dropping, so this cannot error.
            let _ = (&mut ticket.rx).await;
            ticket.key = None;
        }

        KeyedGuard {
            keys: Arc::clone(&self.keys),
            key: Some(key),
        }
    }

    /// Run `op` while holding `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: K, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        op().await
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.keys.lock().contains_key(key)
    }

    /// Number of tasks queued behind the current holder of `key`.
    pub fn waiters(&self, key: &K) -> usize {
        self.keys.lock().get(key).map_or(0, |state| state.waiters.len())
    }

    /// Number of keys currently held.
    pub fn held(&self) -> usize {
        self.keys.lock().len()
    }
}

/// Lock key for a repository: its canonical path, or the literal path when it
/// cannot be canonicalized.
pub fn repo_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl KeyedMutex<PathBuf> {
    pub async fn lock_repo(&self, repo: &Path) -> KeyedGuard<PathBuf> {
        self.lock(repo_key(repo)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn uncontended_lock_cleans_up() {
        let mutex = KeyedMutex::<u64>::new();
        {
            let _guard = mutex.lock(1).await;
            assert!(mutex.is_locked(&1));
        }
        assert!(!mutex.is_locked(&1));
        assert_eq!(mutex.held(), 0);
    }

    #[tokio::test]
    async fn waiters_acquire_in_fifo_order() {
        let mutex = KeyedMutex::<u64>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = mutex.lock(7).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let task_mutex = mutex.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = task_mutex.lock(7).await;
                order.lock().push(i);
            }));
            // Let each task enqueue before spawning the next.
            while mutex.waiters(&7) < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert!(!mutex.is_locked(&7));
    }

    /// Operations on one key never overlap.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_never_interleaves() {
        let mutex = KeyedMutex::<PathBuf>::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mutex = mutex.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                mutex
                    .with_lock(PathBuf::from("/repo"), || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(mutex.held(), 0);
    }

    /// Distinct keys may be held at the same time.
    #[tokio::test]
    async fn distinct_keys_overlap() {
        let mutex = KeyedMutex::<PathBuf>::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = |key: &'static str| {
            let mutex = mutex.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let _guard = mutex.lock(PathBuf::from(key)).await;
                barrier.wait().await;
            })
        };
        let a = run("/repo-a");
        let b = run("/repo-b");
        tokio::time::timeout(Duration::from_secs(5), async {
            a.await.expect("join a");
            b.await.expect("join b");
        })
        .await
        .expect("both holders reached the barrier");
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_strand_the_lock() {
        let mutex = KeyedMutex::<u64>::new();
        let holder = mutex.lock(3).await;

        let cancelled = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock(3).await;
            })
        };
        while mutex.waiters(&3) < 1 {
            tokio::task::yield_now().await;
        }
        let survivor = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock(3).await;
            })
        };
        while mutex.waiters(&3) < 2 {
            tokio::task::yield_now().await;
        }

        cancelled.abort();
        let _ = cancelled.await;
        drop(holder);

        tokio::time::timeout(Duration::from_secs(5), survivor)
            .await
            .expect("survivor acquires")
            .expect("join");
        assert!(!mutex.is_locked(&3));
    }

    #[tokio::test]
    async fn panic_while_holding_releases() {
        let mutex = KeyedMutex::<u64>::new();
        let task = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock(9).await;
                panic!("operation blew up");
            })
        };
        assert!(task.await.is_err());
        let _guard = tokio::time::timeout(Duration::from_secs(1), mutex.lock(9))
            .await
            .expect("lock released by unwinding");
    }

    #[test]
    fn repo_key_falls_back_to_literal_path() {
        let missing = Path::new("/definitely/not/here");
        assert_eq!(repo_key(missing), missing.to_path_buf());
    }
}
