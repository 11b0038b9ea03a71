//! Request coalescing for cache misses.
//!
//! When several callers miss the cache for the same key at once, only the
//! first one starts the fetch or clone; the others await the same shared
//! result.  The work runs on its own task, so it finishes even when every
//! caller has gone away, and releases whatever it holds.  The entry is removed
//! as soon as that task ends, whether it succeeded or failed, so the next miss
//! starts a fresh attempt.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type InFlight<K, V> =
    Arc<Mutex<HashMap<K, Shared<BoxFuture<'static, Result<V, TaskFailed>>>>>>;

/// The shared task panicked or was cancelled before producing a value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("in-flight task failed: {0}")]
pub struct TaskFailed(String);

/// Whether a caller started the shared work or joined someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Deduplicates concurrent operations keyed by `K`.
pub struct Coalescer<K, V> {
    in_flight: InFlight<K, V>,
}

impl<K, V> Clone for Coalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<K, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the operation built by `make` for `key`, or join the one already
    /// in flight.  `make` is only invoked by the leader, and the operation is
    /// spawned onto the runtime.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (Result<V, TaskFailed>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (shared, role) = {
            let mut map = lock(&*self.in_flight);
            match map.get(&key) {
                Some(existing) => (existing.clone(), Role::Follower),
                None => {
                    let in_flight = Arc::clone(&self.in_flight);
                    let owned_key = key.clone();
                    let work = make();
                    let task = tokio::spawn(async move {
                        let _evict = Evict {
                            in_flight,
                            key: owned_key,
                        };
                        work.await
                    });
                    let shared = async move { task.await.map_err(|e| TaskFailed(e.to_string())) }
                        .boxed()
                        .shared();
                    map.insert(key, shared.clone());
                    (shared, Role::Leader)
                }
            }
        };

        (shared.await, role)
    }

    /// Number of keys with work currently in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        lock(&*self.in_flight).len()
    }
}

/// Removes the entry when the spawned task ends, including by panic.
struct Evict<K: Hash + Eq, V> {
    in_flight: InFlight<K, V>,
    key: K,
}

impl<K: Hash + Eq, V> Drop for Evict<K, V> {
    fn drop(&mut self) {
        lock(&*self.in_flight).remove(&self.key);
    }
}

fn lock<K, V>(map: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}
