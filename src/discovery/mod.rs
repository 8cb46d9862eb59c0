//! Repository discovery and its time-boxed cache.
//!
//! [`DiscoveryCache::lookup`] collapses concurrent lookups for the same query
//! signature into one upstream call. The call runs on its own task, which also
//! writes the outcome back into the cache, so the slot resolves even if every
//! caller that was waiting on it goes away. Failures are handed to all current
//! waiters and then forgotten; only successes are cached.

pub mod catalog;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use enhancer_common::RepoMetadata;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::errors::DiscoveryError;

pub use catalog::{CatalogDiscovery, RepoCatalog, RepoListing, summarize_readme};

/// Resolves free text into a concrete repository. Expensive.
#[async_trait]
pub trait RepoDiscovery: Send + Sync {
    async fn discover(&self, query: &str) -> Result<RepoMetadata, DiscoveryError>;
}

/// Discovery when no repository catalog is configured: every query misses.
pub struct NoCatalog;

#[async_trait]
impl RepoDiscovery for NoCatalog {
    async fn discover(&self, query: &str) -> Result<RepoMetadata, DiscoveryError> {
        Err(DiscoveryError::NoMatch(query.to_string()))
    }
}

type Flight = Shared<BoxFuture<'static, Result<RepoMetadata, DiscoveryError>>>;
type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

enum Slot {
    Ready {
        value: RepoMetadata,
        cached_at: Instant,
    },
    InFlight {
        id: u64,
        flight: Flight,
    },
}

/// A flight that already produced a result but whose slot was never settled.
/// Only happens when the flight task itself died.
fn is_finished(flight: &Flight) -> bool {
    flight.peek().is_some()
}

/// Normalized cache key: lowercase tokens, sorted and deduplicated.
pub fn query_signature(query: &str) -> String {
    let mut tokens: Vec<String> = query
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens.join(" ")
}

fn lock(slots: &Mutex<HashMap<String, Slot>>) -> MutexGuard<'_, HashMap<String, Slot>> {
    // A poisoned map only ever holds complete entries; keep using it.
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Replace the in-flight slot `id` with its outcome. A slot that was swept or
/// replaced by a newer flight in the meantime is left alone.
fn settle(
    slots: &Mutex<HashMap<String, Slot>>,
    key: &str,
    id: u64,
    result: &Result<RepoMetadata, DiscoveryError>,
) {
    let mut slots = lock(slots);
    let ours = matches!(slots.get(key), Some(Slot::InFlight { id: current, .. }) if *current == id);
    if !ours {
        return;
    }
    match result {
        Ok(value) => {
            slots.insert(
                key.to_string(),
                Slot::Ready {
                    value: value.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Err(e) => {
            tracing::warn!(query = %key, error = %e, "Discovery failed; not caching");
            slots.remove(key);
        }
    }
}

pub struct DiscoveryCache {
    discovery: Arc<dyn RepoDiscovery>,
    ttl: Duration,
    slots: SlotMap,
    next_flight: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(discovery: Arc<dyn RepoDiscovery>, ttl: Duration) -> Self {
        Self {
            discovery,
            ttl,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_flight: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        lock(&self.slots)
    }

    pub async fn lookup(&self, query: &str) -> Result<RepoMetadata, DiscoveryError> {
        let key = query_signature(query);
        if key.is_empty() {
            return Err(DiscoveryError::NoMatch(query.to_string()));
        }

        let flight = {
            let mut slots = self.slots();
            let joined = match slots.get(&key) {
                Some(Slot::Ready { value, cached_at }) if cached_at.elapsed() < self.ttl => {
                    tracing::debug!(query = %key, "Discovery cache hit");
                    return Ok(value.clone());
                }
                Some(Slot::InFlight { flight, .. }) if !is_finished(flight) => Some(flight.clone()),
                _ => None,
            };
            match joined {
                Some(flight) => {
                    tracing::debug!(query = %key, "Joining in-flight discovery");
                    flight
                }
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = self.start_flight(key.clone(), id, query.to_string());
                    slots.insert(
                        key.clone(),
                        Slot::InFlight {
                            id,
                            flight: flight.clone(),
                        },
                    );
                    tracing::debug!(query = %key, "Discovery cache miss");
                    flight
                }
            }
        };

        flight.await
    }

    /// Spawn the upstream call. The task settles slot `key`/`id` itself before
    /// handing the result to waiters.
    fn start_flight(&self, key: String, id: u64, query: String) -> Flight {
        let discovery = self.discovery.clone();
        let slots = self.slots.clone();
        let handle = tokio::spawn(async move {
            let result = match tokio::spawn(async move { discovery.discover(&query).await }).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(query = %key, error = %e, "Discovery task did not complete");
                    Err(DiscoveryError::Abandoned)
                }
            };
            settle(&slots, &key, id, &result);
            result
        });
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "Discovery flight did not complete");
                    Err(DiscoveryError::Abandoned)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Seed an entry directly, e.g. from a catalog sync. In-flight lookups
    /// for the same key are left to finish and overwrite it.
    pub fn prime(&self, query: &str, value: RepoMetadata) {
        let key = query_signature(query);
        if key.is_empty() {
            return;
        }
        let mut slots = self.slots();
        if matches!(slots.get(&key), Some(Slot::InFlight { flight, .. }) if !is_finished(flight)) {
            return;
        }
        slots.insert(
            key,
            Slot::Ready {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries and dead flights. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { cached_at, .. } => cached_at.elapsed() < self.ttl,
            Slot::InFlight { flight, .. } => !is_finished(flight),
        });
        before - slots.len()
    }

    /// Number of unexpired cached entries.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|s| matches!(s, Slot::Ready { cached_at, .. } if cached_at.elapsed() < self.ttl))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
