//! Token bucket rate limiter guarding the downstream AI service.
//!
//! Capacity is measured in abstract units (estimated LLM tokens). The bucket
//! refills continuously at `refill_rate` units per second and never holds
//! more than `capacity`. A reservation either deducts the full amount or
//! leaves the bucket untouched; there is no blocking variant, callers that
//! are refused defer their work to a later cycle.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::RateLimitError;

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: DateTime<Utc>,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket driven by the wall clock.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self::with_clock(capacity, refill_rate, Arc::new(SystemClock))
    }

    /// Create a full bucket driven by the given clock.
    pub fn with_clock(capacity: f64, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(0.0);
        let now = clock.now();
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            clock,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: now,
            }),
        }
    }

    /// Try to reserve `units`.
    ///
    /// Returns `Ok(true)` when granted, `Ok(false)` when the bucket is short
    /// right now. Amounts above capacity can never be granted and are
    /// reported as [`RateLimitError::ExceedsCapacity`].
    pub fn try_consume(&self, units: f64) -> Result<bool, RateLimitError> {
        if !units.is_finite() || units <= 0.0 {
            return Err(RateLimitError::InvalidCost { units });
        }
        if units > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                units,
                capacity: self.capacity,
            });
        }

        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, now);

        if state.available >= units {
            state.available -= units;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Units available right now, after accounting for refill.
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, now);
        state.available
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, state: &mut BucketState, now: DateTime<Utc>) {
        // A clock stepping backwards refills nothing and keeps the old mark.
        if now <= state.last_refill {
            return;
        }
        let elapsed = (now - state.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        state.available = (state.available + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish_non_exhaustive()
    }
}
