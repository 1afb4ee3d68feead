//! Three-gate admission control: a global token bucket, lazily created
//! per-client buckets, and an in-flight concurrency cap.
//!
//! `max_concurrent` bounds in-flight *requests*, not in-flight containers:
//! the front-end releases its slot when the handler returns, including on
//! the timeout path where the worker may still be executing. This keeps
//! user-visible latency bounded.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            // Buckets start full so clients get their burst up front
            tokens: burst,
            burst,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    global: Mutex<TokenBucket>,
    per_client: DashMap<String, TokenBucket>,
    client_rate: f64,
    client_burst: f64,
    max_concurrent: u32,
    in_flight: Mutex<u32>,
}

impl RateLimiter {
    pub fn new(
        global_rps: f64,
        per_client_rps: f64,
        per_client_burst: u32,
        max_concurrent: u32,
    ) -> Self {
        Self {
            global: Mutex::new(TokenBucket::new(global_rps, global_rps * 2.0)),
            per_client: DashMap::new(),
            client_rate: per_client_rps,
            client_burst: per_client_burst as f64,
            max_concurrent,
            in_flight: Mutex::new(0),
        }
    }

    /// Combined admission check. Every `true` must be balanced by one
    /// `done()` call when the request finishes.
    pub fn allow(&self, key: &str) -> bool {
        if !self.global.lock().unwrap_or_else(|e| e.into_inner()).try_acquire() {
            metrics::global().rate_limit_hits.inc();
            return false;
        }

        let admitted = self
            .per_client
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.client_rate, self.client_burst))
            .try_acquire();
        if !admitted {
            metrics::global().rate_limit_hits.inc();
            return false;
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if *in_flight >= self.max_concurrent {
            metrics::global().rate_limit_hits.inc();
            return false;
        }
        *in_flight += 1;
        true
    }

    /// Release one concurrency unit.
    pub fn done(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *in_flight = in_flight.saturating_sub(1);
    }

    /// Requests currently between `allow` and `done`.
    pub fn in_flight(&self) -> u32 {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Periodically evict every per-client bucket so the map stays bounded.
    /// Active clients simply get a fresh bucket on their next request.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let evicted = self.per_client.len();
                self.per_client.clear();
                debug!(evicted, "evicted per-client rate limit buckets");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_burst_is_twice_the_rate() {
        // rate 2/s, burst 4; concurrency effectively unlimited
        let limiter = RateLimiter::new(2.0, 1000.0, 1000, 1000);
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.allow("a") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 4);
    }

    #[test]
    fn per_client_rejection_leaves_other_clients_admitted() {
        let limiter = RateLimiter::new(1000.0, 1.0, 2, 1000);

        assert!(limiter.allow("hog"));
        assert!(limiter.allow("hog"));
        assert!(!limiter.allow("hog"), "hog exhausted its burst");
        assert!(limiter.allow("quiet"), "other clients are unaffected");
    }

    #[test]
    fn concurrency_gate_bounds_in_flight_requests() {
        let limiter = RateLimiter::new(1000.0, 1000.0, 1000, 2);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("c"));
        assert_eq!(limiter.in_flight(), 2);

        limiter.done();
        assert!(limiter.allow("c"));
        assert_eq!(limiter.in_flight(), 2);
    }

    #[test]
    fn denied_requests_do_not_consume_a_slot() {
        let limiter = RateLimiter::new(1000.0, 1.0, 1, 10);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert_eq!(limiter.in_flight(), 1);
    }

    #[test]
    fn done_never_underflows() {
        let limiter = RateLimiter::new(1000.0, 1000.0, 1000, 2);
        limiter.done();
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn eviction_recreates_buckets_on_next_request() {
        let limiter = RateLimiter::new(1000.0, 1.0, 1, 1000);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        limiter.per_client.clear();
        assert!(limiter.allow("a"), "a fresh bucket admits again");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_evicts_idle_buckets() {
        let limiter = Arc::new(RateLimiter::new(1000.0, 1.0, 1, 1000));
        assert!(limiter.allow("a"));
        assert_eq!(limiter.per_client.len(), 1);

        let handle = limiter.clone().spawn_cleanup(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(limiter.per_client.is_empty());
        handle.abort();
    }
}
