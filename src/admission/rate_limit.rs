//! Per-source token bucket rate limiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::admission::AdmissionHandler;
use crate::transport::CloseSignal;
use crate::utils::commands::{self, CommandHandlers};
use crate::utils::error::{Error, Result};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;
    }
}

/// One token bucket per source address, created on first sight with a full bucket.
///
/// The bucket map has its own lock, independent of anything on the routing path.
#[derive(Debug)]
pub struct IpRateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl IpRateLimiter {
    /// `refill_rate` is in tokens per second.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token from `source`'s bucket. Returns `false` if it is empty.
    pub fn try_acquire(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(source.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.capacity,
                last_update: now,
            });
        bucket.refill(self.capacity, self.refill_rate, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available to `source`, or `None` if it was never seen.
    pub fn available_tokens(&self, source: &str) -> Option<f64> {
        let buckets = self.buckets.lock();
        buckets.get(source).map(|bucket| {
            let elapsed = bucket.last_update.elapsed().as_secs_f64();
            (bucket.tokens + elapsed * self.refill_rate).min(self.capacity)
        })
    }

    /// Refills `source`'s bucket to capacity. Returns `false` for unknown sources.
    pub fn refill(&self, source: &str) -> bool {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(source) {
            Some(bucket) => {
                bucket.tokens = self.capacity;
                bucket.last_update = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drops buckets that have refilled completely; they are indistinguishable
    /// from fresh ones. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.refill(self.capacity, self.refill_rate, now);
            bucket.tokens < self.capacity
        });
        before - buckets.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Prunes every `interval` until `stop` fires.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration, stop: CloseSignal) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.fired() => break,
                    _ = ticker.tick() => {
                        let pruned = limiter.prune();
                        if pruned > 0 {
                            debug!(pruned, "pruned idle rate limiter buckets");
                        }
                    }
                }
            }
        })
    }

    /// `refill <source>` and `prune`.
    pub fn commands(self: &Arc<Self>) -> CommandHandlers {
        let mut handlers = CommandHandlers::new();

        let limiter = Arc::clone(self);
        handlers.insert(
            "refill".to_string(),
            commands::handler(move |args| {
                let limiter = limiter.clone();
                async move {
                    let source = commands::single_arg("refill", &args)?;
                    if limiter.refill(&source) {
                        Ok("success".to_string())
                    } else {
                        Err(Error::protocol(format!("no bucket for {source}")))
                    }
                }
            }),
        );

        let limiter = Arc::clone(self);
        handlers.insert(
            "prune".to_string(),
            commands::handler(move |_args| {
                let limiter = limiter.clone();
                async move { Ok(limiter.prune().to_string()) }
            }),
        );

        handlers
    }
}

impl AdmissionHandler for IpRateLimiter {
    fn admit(&self, source: &str) -> Result<()> {
        if self.try_acquire(source) {
            Ok(())
        } else {
            Err(Error::AdmissionRejected(format!(
                "{source} exceeded the connection rate limit"
            )))
        }
    }
}
