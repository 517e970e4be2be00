//! Single-flight: coalesce concurrent calls keyed by `K` into one execution
//! of the underlying future. Concurrent `Read`/`Exists` calls invoke the
//! backend at most once per in-flight batch.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

struct Inflight<V, E> {
    token: u64,
    fut: Shared<BoxFuture<'static, Result<V, E>>>,
}

impl<V: Clone, E: Clone> Clone for Inflight<V, E> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            fut: self.fut.clone(),
        }
    }
}

pub struct SingleFlight<K, V, E> {
    inflight: DashMap<K, Inflight<V, E>>,
    next_token: AtomicU64,
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make_future()` for `key`, or join an already in-flight call for
    /// the same key. The backend-hitting future is only ever constructed
    /// (and polled) for the first caller in a batch.
    pub async fn run<F>(&self, key: K, make_future: F) -> Result<V, E>
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (token, shared) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(e) => {
                let v = e.get();
                (v.token, v.fut.clone())
            }
            Entry::Vacant(e) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let shared = make_future.boxed().shared();
                e.insert(Inflight {
                    token,
                    fut: shared.clone(),
                });
                (token, shared)
            }
        };

        let result = shared.await;
        // Only the batch that inserted this token clears it — a later
        // batch for the same key may already have replaced the entry.
        self.inflight.remove_if(&key, |_, v| v.token == token);
        result
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }
}
