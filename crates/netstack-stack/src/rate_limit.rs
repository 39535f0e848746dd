//! Token-bucket rate limiter for ICMP egress.

use std::sync::{Arc, Mutex};

use netstack_core::{Clock, MonotonicTime};

/// Default maximum ICMP messages per second.
pub const DEFAULT_ICMP_LIMIT: f64 = 1000.0;

/// Default maximum ICMP burst size.
pub const DEFAULT_ICMP_BURST: usize = 50;

struct BucketState {
    tokens: f64,
    last: MonotonicTime,
    limit: f64,
    burst: usize,
}

/// A token bucket gating stack-generated ICMP messages.
pub struct IcmpRateLimiter {
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl IcmpRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            state: Mutex::new(BucketState {
                tokens: DEFAULT_ICMP_BURST as f64,
                last: now,
                limit: DEFAULT_ICMP_LIMIT,
                burst: DEFAULT_ICMP_BURST,
            }),
        }
    }

    /// Maximum messages per second.
    #[must_use]
    pub fn limit(&self) -> f64 {
        self.state.lock().unwrap().limit
    }

    pub fn set_limit(&self, limit: f64) {
        let mut state = self.state.lock().unwrap();
        state.limit = limit.max(0.0);
    }

    /// Maximum messages in a single burst.
    #[must_use]
    pub fn burst(&self) -> usize {
        self.state.lock().unwrap().burst
    }

    pub fn set_burst(&self, burst: usize) {
        let mut state = self.state.lock().unwrap();
        state.burst = burst;
        state.tokens = state.tokens.min(burst as f64);
    }

    /// Take a token if one is available right now.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let elapsed = now.since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.limit).min(state.burst as f64);
        state.last = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
