//! Per-client IP rate limiting for authenticated endpoints.
//!
//! One keyed GCRA limiter covers every peer; governor's dashmap-backed
//! keyed store tracks per-IP state internally, and a housekeeping task
//! prunes state for peers that have gone quiet so the map cannot grow
//! without bound.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

use switchboard_core::config::RateLimitConfig;

/// How often idle per-IP state is pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(150);

/// Per-client IP rate limiter.
pub struct PerIpRateLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
}

impl PerIpRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Arc<Self> {
        let quota =
            Quota::per_second(positive(config.rps, 100)).allow_burst(positive(config.burst, 200));

        tracing::info!(
            rps = config.rps,
            burst = config.burst,
            "per-IP rate limiter configured"
        );

        Arc::new(Self {
            limiter: RateLimiter::keyed(quota),
        })
    }

    /// True if a request from this IP is allowed right now.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }

    /// Drop state for IPs whose rate cells have fully replenished.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Number of IPs with live limiter state.
    pub fn tracked_ips(&self) -> usize {
        self.limiter.len()
    }

    /// Spawn the periodic pruning task; stops when the token is cancelled.
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRUNE_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.prune();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

/// Non-zero quota component. Config validation rejects zeroes at startup;
/// the fallback keeps construction total regardless.
fn positive(value: u32, fallback: u32) -> NonZeroU32 {
    NonZeroU32::new(value)
        .or_else(|| NonZeroU32::new(fallback))
        .expect("BUG: fallback quota value is zero")
}
