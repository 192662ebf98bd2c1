//! Concurrency-safe per-client limiter state with idle eviction.
//!
//! # Locking
//!
//! One store-wide mutex guards the whole map. Lookup, insertion and the
//! bucket arithmetic for a request all happen inside a single critical
//! section of O(1) work, so two requests from the same client can never
//! both spend the same token. Nothing performs I/O under the lock.
//!
//! # Janitor
//!
//! [`run_janitor`] wakes every `clean_interval` and drops buckets whose
//! client has been silent for longer than `inactivity_threshold`. A client
//! that comes back later simply gets a fresh, full bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::bucket::{RateLimitDecision, TokenBucket};
use super::ip::ClientKey;
use crate::metrics;

/// Mapping from client identity to its token bucket.
#[derive(Debug)]
pub struct ClientStateStore {
    buckets: Mutex<HashMap<ClientKey, TokenBucket>>,
    capacity: u32,
    refill_per_second: f64,
}

impl ClientStateStore {
    /// Create an empty store whose buckets use the given parameters.
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_per_second,
        }
    }

    /// Run `f` on the bucket for `key`, creating a full one if needed.
    ///
    /// Marks the client as seen at `now`. The bucket reference cannot escape
    /// the closure, so every read and write happens under the store lock.
    pub fn with_bucket<R>(
        &self,
        key: ClientKey,
        now: Instant,
        f: impl FnOnce(&mut TokenBucket) -> R,
    ) -> R {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(|| {
            trace!(client = %key, "Creating token bucket");
            TokenBucket::new(self.capacity, self.refill_per_second, now)
        });
        bucket.touch(now);
        f(bucket)
    }

    /// Spend one token for `key` and report the decision.
    pub fn check(&self, key: ClientKey, now: Instant) -> RateLimitDecision {
        self.with_bucket(key, now, |bucket| bucket.try_acquire(now))
    }

    /// Remove every bucket idle for longer than `threshold`.
    ///
    /// Returns the number of evicted clients.
    pub fn evict_idle(&self, now: Instant, threshold: Duration) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_idle(now, threshold));
        before - buckets.len()
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Whether `key` currently has a bucket.
    pub fn contains(&self, key: &ClientKey) -> bool {
        self.buckets.lock().contains_key(key)
    }

    /// Burst size given to new buckets.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Periodically evict idle clients until `cancel` fires.
pub async fn run_janitor(
    store: Arc<ClientStateStore>,
    clean_interval: Duration,
    inactivity_threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(clean_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip the first immediate tick

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Rate limit janitor received cancellation signal");
                break;
            }
            _ = ticker.tick() => {
                let evicted = store.evict_idle(Instant::now(), inactivity_threshold);
                let tracked = store.len();
                metrics::record_rate_limit_evictions(evicted as u64);
                metrics::set_rate_limit_tracked_clients(tracked);
                if evicted > 0 {
                    debug!(evicted, tracked, "Evicted idle rate limit clients");
                }
            }
        }
    }

    debug!("Rate limit janitor shutting down");
}
