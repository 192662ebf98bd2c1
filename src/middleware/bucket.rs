//! Continuous-refill token bucket.
//!
//! Tokens refill continuously at `refill_per_second` (no discrete ticks) up
//! to `capacity`. Each admitted request consumes one whole token; the bucket
//! keeps the fractional remainder so slow refill rates are honoured exactly.
//!
//! Buckets carry no lock of their own. They are owned by
//! [`ClientStateStore`](super::store::ClientStateStore) and only touched
//! while its lock is held.

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Bucket capacity (burst size).
    pub limit: u32,
    /// Tokens left after this decision, including the fractional part.
    pub remaining: f64,
    /// Time until one whole token is available, set on rejection.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Remaining tokens floored to a whole number, as sent to clients.
    pub fn remaining_whole(&self) -> u64 {
        // tokens are clamped to [0, capacity], so the cast cannot wrap
        self.remaining.floor() as u64
    }

    /// `Retry-After` value in whole seconds, never below 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|wait| (wait.as_secs_f64().ceil() as u64).max(1))
    }
}

/// Per-client throttling state.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_second: f64,
    tokens: f64,
    last_seen: Instant,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: f64::from(capacity),
            last_seen: now,
            last_refill: now,
        }
    }

    /// Add the tokens accrued since the last refill, capped at capacity.
    ///
    /// A `now` older than the last refill (a caller that read the clock
    /// before waiting for the store lock) adds nothing and leaves the
    /// refill mark where it is.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(f64::from(self.capacity));
        self.last_refill = self.last_refill.max(now);
    }

    /// Refill, then try to consume one token.
    pub fn try_acquire(&mut self, now: Instant) -> RateLimitDecision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitDecision {
                allowed: true,
                limit: self.capacity,
                remaining: self.tokens,
                retry_after: None,
            };
        }

        // Tiny rates overflow `Duration`; saturate instead.
        let deficit = 1.0 - self.tokens;
        let wait = Duration::try_from_secs_f64(deficit / self.refill_per_second)
            .unwrap_or(Duration::MAX);
        RateLimitDecision {
            allowed: false,
            limit: self.capacity,
            remaining: self.tokens,
            retry_after: Some(wait),
        }
    }

    /// Record activity from the client. Never moves backwards.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = self.last_seen.max(now);
    }

    /// Whether the client has been silent for longer than `threshold`.
    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > threshold
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Current token count as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}
