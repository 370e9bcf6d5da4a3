//! Multi-window rate limit evaluation.
//!
//! Each client identity is tracked across four fixed calendar windows
//! (second, minute, hour, day), one rolling burst window, and one
//! per-endpoint minute window. Window keys embed an epoch bucket integer
//! (`now_secs / window_secs`), so a new bucket is implicitly a fresh zero
//! counter and the previous bucket ages out by TTL.
//!
//! Evaluation is increment-then-compare: every counter is bumped first and
//! the decision is made from the post-increment values, which makes the
//! check race-safe without any per-IP locking. Thresholds are inclusive
//! ceilings; the value equal to the limit is admitted and the first value
//! strictly above it is denied, so under any interleaving exactly `limit`
//! requests per window get through.
//!
//! Breaching the second or minute window is a DDoS signal and escalates to
//! a temporary block through the [`AccessRegistry`]; hour, day, and burst
//! breaches deny only the request at hand.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::admission::AccessDecision;
use crate::config::AdmissionConfig;
use crate::registry::AccessRegistry;
use crate::store::{CounterStore, unix_now};

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);
const DAY_WINDOW: Duration = Duration::from_secs(86400);

/// Rolling burst window; reset purely by TTL, never calendar-aligned, so
/// sustained bursts straddling second boundaries are still caught.
const BURST_WINDOW: Duration = Duration::from_secs(10);

fn second_key(ip: &str, now_secs: u64) -> String {
    format!("rate:second:{ip}:{now_secs}")
}

fn minute_key(ip: &str, now_secs: u64) -> String {
    format!("rate:minute:{ip}:{}", now_secs / 60)
}

fn hour_key(ip: &str, now_secs: u64) -> String {
    format!("rate:hour:{ip}:{}", now_secs / 3600)
}

fn day_key(ip: &str, now_secs: u64) -> String {
    format!("rate:day:{ip}:{}", now_secs / 86400)
}

fn burst_key(ip: &str) -> String {
    format!("rate:burst:{ip}")
}

fn endpoint_key(ip: &str, endpoint: &str, now_secs: u64) -> String {
    format!("rate:endpoint:{ip}:{endpoint}:{}", now_secs / 60)
}

/// Evaluates requests against the configured rate-limit windows.
///
/// Cheap to clone; clones share the underlying store and registry.
#[derive(Debug, Clone)]
pub struct RateLimitEngine {
    store: CounterStore,
    registry: Arc<AccessRegistry>,
    config: Arc<AdmissionConfig>,
}

impl RateLimitEngine {
    /// Creates an engine over the given store and registry.
    pub fn new(
        store: CounterStore,
        registry: Arc<AccessRegistry>,
        config: Arc<AdmissionConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Evaluates one request from `ip` against every window.
    ///
    /// Whitelisted identities are admitted without touching any counter, so
    /// their traffic never contributes to window counts.
    pub async fn check_rate_limit(&self, ip: &str, endpoint: &str) -> AccessDecision {
        self.evaluate(ip, endpoint, unix_now()).await
    }

    async fn evaluate(&self, ip: &str, endpoint: &str, now_secs: u64) -> AccessDecision {
        if self.registry.is_whitelisted(ip) {
            return AccessDecision::allow("Whitelisted IP");
        }

        let (second, minute, hour, day, burst, endpoint_hits) = tokio::join!(
            self.bump(second_key(ip, now_secs), SECOND_WINDOW),
            self.bump(minute_key(ip, now_secs), MINUTE_WINDOW),
            self.bump(hour_key(ip, now_secs), HOUR_WINDOW),
            self.bump(day_key(ip, now_secs), DAY_WINDOW),
            self.bump(burst_key(ip), BURST_WINDOW),
            self.bump(endpoint_key(ip, endpoint, now_secs), MINUTE_WINDOW),
        );

        let limits = &self.config;

        if second > limits.ddos_threshold_per_second.into() {
            self.escalate(ip, "Too many requests per second").await;
            return AccessDecision::deny("DDoS protection triggered");
        }

        if minute > limits.requests_per_minute.into() {
            self.escalate(ip, "Too many requests per minute").await;
            return AccessDecision::deny("Rate limit exceeded (per minute)");
        }

        if hour > limits.requests_per_hour.into() {
            return AccessDecision::deny("Rate limit exceeded (per hour)");
        }

        if day > limits.requests_per_day.into() {
            return AccessDecision::deny("Rate limit exceeded (per day)");
        }

        if burst > limits.burst_capacity.into() {
            return AccessDecision::deny("Burst limit exceeded");
        }

        if endpoint_hits > limits.max_same_endpoint_requests.into() {
            self.registry.mark_suspicious(
                ip,
                &format!("Excessive same endpoint requests: {endpoint}"),
            );
        }

        AccessDecision::allow("Request allowed")
    }

    /// Increments one window counter, failing open (count of zero) if the
    /// store is unavailable so a backend outage never denies traffic.
    async fn bump(&self, key: String, ttl: Duration) -> u64 {
        match self.store.increment(&key, ttl).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key, %e, "counter increment failed, failing open");
                0
            }
        }
    }

    async fn escalate(&self, ip: &str, reason: &str) {
        warn!(ip, reason, "DDoS pattern detected");
        self.registry
            .block_temporarily(ip, self.config.ddos_block_duration_minutes.into(), reason)
            .await;
    }
}
