//! Post-response abuse pattern detection.
//!
//! Consumes `(client, status)` signals after each completed request and
//! keeps a per-minute tally of error responses per client. Despite the
//! config name `max_consecutive_errors`, this is a bucketed tally, not a
//! strict consecutive-run detector: interleaved successes reset nothing,
//! only the minute boundary does.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::AdmissionConfig;
use crate::registry::AccessRegistry;
use crate::store::{CounterStore, unix_now};

const ERROR_WINDOW: Duration = Duration::from_secs(60);

fn error_key(ip: &str, now_secs: u64) -> String {
    format!("errors:{ip}:{}", now_secs / 60)
}

/// Tracks error responses and escalates abusive clients to a temporary
/// block.
///
/// Cheap to clone; clones share the underlying store and registry.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    store: CounterStore,
    registry: Arc<AccessRegistry>,
    config: Arc<AdmissionConfig>,
}

impl PatternDetector {
    /// Creates a detector over the given store and registry.
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

    /// Records one completed response. Statuses below 400 are ignored;
    /// when the minute tally reaches `max_consecutive_errors`, the client
    /// is temporarily blocked for `suspicious_block_minutes`.
    pub async fn track_error_response(&self, ip: &str, status: u16) {
        if status < 400 {
            return;
        }
        self.record_error(ip, unix_now()).await;
    }

    async fn record_error(&self, ip: &str, now_secs: u64) {
        let key = error_key(ip, now_secs);
        match self.store.increment(&key, ERROR_WINDOW).await {
            Ok(count) if count >= self.config.max_consecutive_errors.into() => {
                self.registry
                    .block_temporarily(
                        ip,
                        self.config.suspicious_block_minutes.into(),
                        "Too many error responses",
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!(ip, %e, "error tally increment failed"),
        }
    }
}
