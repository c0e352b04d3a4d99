//! Runner-side cache of fetched dependencies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One cached dependency.
#[derive(Debug, Clone)]
pub struct CachedResource {
    pub name: String,
    pub bytes: Bytes,
    pub fetched_at: Instant,
}

/// Dependencies keyed by name, evicted after `max_age`.
///
/// Lookups hand out a clone of the `Bytes`, so an entry evicted right after
/// a lookup stays valid for the task that received it. Lookup and sweep take
/// the same lock.
#[derive(Debug)]
pub struct ResourceCache {
    entries: Mutex<HashMap<String, CachedResource>>,
    max_age: Option<Duration>,
}

impl ResourceCache {
    /// `None` keeps entries forever.
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedResource>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, entry: &CachedResource, now: Instant) -> bool {
        self.max_age
            .is_some_and(|max| now.duration_since(entry.fetched_at) >= max)
    }

    /// Fresh bytes for `name`. An expired entry is dropped on the way.
    pub fn get(&self, name: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired = self.is_expired(entries.get(name)?, now);
        if expired {
            entries.remove(name);
            tracing::debug!(name, "Cached dependency expired");
            return None;
        }
        entries.get(name).map(|e| e.bytes.clone())
    }

    pub fn insert(&self, name: impl Into<String>, bytes: Bytes) {
        let name = name.into();
        self.lock().insert(
            name.clone(),
            CachedResource {
                name,
                bytes,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = cache.len(), "Dependency cache swept");
                        }
                    }
                }
            }
        })
    }
}
