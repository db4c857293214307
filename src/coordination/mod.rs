//! Process-wide coordination core.
//!
//! Two primitives share one table of string keys (volume ids, snapshot ids,
//! staging paths):
//!
//! - [`OperationLocks::lock`]: a keyed mutex. Node-side operations block on
//!   it so that stage/publish calls for the same (volume, path) serialize
//!   transparently.
//! - [`OperationLocks::try_begin`]: a fast-fail in-flight marker. Controller
//!   operations use it and answer `Aborted` on conflict; the CSI sidecars
//!   retry on that code.
//!
//! Lock entries are created lazily on first use and freed once the keyed
//! wait-count returns to zero, so the table stays bounded by the number of
//! concurrently touched resources.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, LockEntry>>,
    inflight: Mutex<HashSet<String>>,
}

struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    // holders + waiters; the entry is removed when this returns to zero
    count: usize,
}

impl OperationLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the keyed mutex, waiting until any current holder releases
    /// it. Waiters are queued fairly (tokio mutexes are FIFO).
    pub async fn lock(self: &Arc<Self>, key: &str) -> LockGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            let entry = locks.entry(key.to_string()).or_insert_with(|| LockEntry {
                mutex: Arc::new(AsyncMutex::new(())),
                count: 0,
            });
            entry.count += 1;
            Arc::clone(&entry.mutex)
        };

        let guard = mutex.lock_owned().await;
        LockGuard {
            owner: Arc::clone(self),
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Marks "key" as having an operation in flight. Returns None when
    /// another operation already holds the marker; the caller answers
    /// `Aborted` in that case.
    pub fn try_begin(self: &Arc<Self>, key: &str) -> Option<InFlightGuard> {
        let mut inflight = self.inflight.lock().unwrap();
        if !inflight.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            owner: Arc::clone(self),
            key: key.to_string(),
        })
    }

    fn release_lock(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get_mut(key) {
            entry.count -= 1;
            if entry.count == 0 {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Held while a keyed mutex is owned; releases on drop.
pub struct LockGuard {
    owner: Arc<OperationLocks>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.owner.release_lock(&self.key);
    }
}

/// Held while an operation is marked in flight; clears the marker on drop.
pub struct InFlightGuard {
    owner: Arc<OperationLocks>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.inflight.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let locks = OperationLocks::new();
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let busy = Arc::clone(&busy);
            let overlaps = Arc::clone(&overlaps);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("vol-0a1b2c3d").await;
                if busy.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                sleep(Duration::from_millis(5)).await;
                busy.store(false, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(locks.lock_table_len(), 0);
    }

    #[tokio::test]
    async fn lock_disjoint_keys_run_in_parallel() {
        let locks = OperationLocks::new();
        let g1 = locks.lock("vol-1").await;

        // a different key must not block
        let g2 = tokio::time::timeout(Duration::from_millis(100), locks.lock("vol-2"))
            .await
            .expect("disjoint key blocked");

        drop(g1);
        drop(g2);
        assert_eq!(locks.lock_table_len(), 0);
    }

    #[tokio::test]
    async fn try_begin_fast_fails_then_recovers() {
        let locks = OperationLocks::new();

        let guard = locks.try_begin("snap-1").expect("first begin");
        assert!(locks.try_begin("snap-1").is_none());
        assert!(locks.try_begin("snap-2").is_some());

        drop(guard);
        assert!(locks.try_begin("snap-1").is_some());
    }
}
