//! Cold-miss request coalescing.
//!
//! The first request for a key spawns the fetch; later requests for the same
//! key await the same shared future. The fetch runs on its own task, so a
//! caller that goes away never cancels it, and its map slot is released only
//! after the fetch future (which includes storing the result) completes.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use metrics::counter;
use tracing::warn;

use super::keys::CacheKey;
use super::stats::METRIC_COALESCED_WAIT;

type SharedFetch<T> = Shared<BoxFuture<'static, Option<T>>>;

/// How a caller took part in a coalesced fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the fetch.
    Leader,
    /// Joined a fetch already in flight.
    Follower,
}

struct Slot<T: Clone> {
    generation: u64,
    fetch: SharedFetch<T>,
}

/// Frees the map slot when the fetch task ends, including by panic.
struct SlotRelease<T>
where
    T: Clone + Send + Sync + 'static,
{
    registry: Arc<InFlight<T>>,
    key: CacheKey,
    generation: u64,
}

impl<T> Drop for SlotRelease<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .pending
            .remove_if(&self.key, |_, slot| slot.generation == generation);
    }
}

/// Tracks in-flight origin fetches per key.
pub struct InFlight<T: Clone> {
    pending: DashMap<CacheKey, Slot<T>>,
    generation: AtomicU64,
}

impl<T> Default for InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `fetch` for `key` unless one is already in flight, and return its
    /// output. `None` means the fetch task panicked.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: &CacheKey, fetch: F) -> (Option<T>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (shared, role) = match self.pending.entry(key.clone()) {
            Entry::Occupied(slot) => (slot.get().fetch.clone(), Role::Follower),
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let task = fetch();
                let registry = Arc::clone(self);
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    let _release = SlotRelease {
                        registry,
                        key: task_key,
                        generation,
                    };
                    task.await
                });
                let fetch = handle
                    .map(|joined| match joined {
                        Ok(output) => Some(output),
                        Err(err) => {
                            warn!(error = %err, "Coalesced origin fetch task failed");
                            None
                        }
                    })
                    .boxed()
                    .shared();
                slot.insert(Slot {
                    generation,
                    fetch: fetch.clone(),
                });
                (fetch, Role::Leader)
            }
        };

        if role == Role::Follower {
            counter!(METRIC_COALESCED_WAIT).increment(1);
        }
        (shared.await, role)
    }

    /// Number of keys with a fetch in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
