//! IP access registry: whitelist, permanent blacklist, and temporary blocks.
//!
//! Whitelist and blacklist membership are process-local concurrent sets,
//! mutated only through this API and readable by any number of concurrent
//! callers. Temporary blocks are persisted through the [`CounterStore`] so
//! they are shared across instances when the redis backend is configured;
//! with the local backend the store *is* the in-memory fallback.
//!
//! Whitelist membership always wins: a whitelisted IP can never be
//! blacklisted, blocked, or rate limited. Storage failures on the read path
//! fail open (the IP is treated as not blocked); failures on the write path
//! are logged and swallowed, since the request being evaluated is never the
//! one being blocked.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::admission::AccessDecision;
use crate::config::AdmissionConfig;
use crate::store::{CounterStore, unix_now};

/// How long a suspicious-pattern marker is retained.
const SUSPICIOUS_MARKER_TTL: Duration = Duration::from_secs(3600);

fn block_key(ip: &str) -> String {
    format!("block:ip:{ip}")
}

fn suspicious_key(ip: &str) -> String {
    format!("suspicious:ip:{ip}")
}

/// A time-boxed deny entry for one client identity.
///
/// Stored as JSON through the counter store with a matching TTL. A new
/// block for the same IP overwrites the previous one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TempBlock {
    /// The blocked client identity.
    pub ip: String,
    /// Unix seconds when the block was imposed.
    pub blocked_at: u64,
    /// Unix seconds when the block lapses.
    pub expires_at: u64,
    /// Human-readable reason recorded with the block.
    pub reason: String,
}

#[derive(Debug)]
struct BlacklistEntry {
    reason: String,
    added_at: u64,
}

/// Owns the three tiers of per-IP access state.
///
/// Constructed once at startup with the configured seed lists and shared
/// behind an `Arc`.
#[derive(Debug)]
pub struct AccessRegistry {
    store: CounterStore,
    whitelist: DashSet<String>,
    blacklist: DashMap<String, BlacklistEntry>,
}

impl AccessRegistry {
    /// Creates a registry seeded from the configured whitelist and
    /// blacklist.
    pub fn new(store: CounterStore, seed: &AdmissionConfig) -> Self {
        let whitelist: DashSet<String> = seed.whitelist.iter().cloned().collect();
        let blacklist: DashMap<String, BlacklistEntry> = seed
            .blacklist
            .iter()
            .map(|ip| {
                (
                    ip.clone(),
                    BlacklistEntry {
                        reason: "Configured blacklist".into(),
                        added_at: unix_now(),
                    },
                )
            })
            .collect();

        info!(
            whitelisted = whitelist.len(),
            blacklisted = blacklist.len(),
            "initialized IP access lists"
        );

        Self {
            store,
            whitelist,
            blacklist,
        }
    }

    /// Gates a client identity: whitelist first (allow, short-circuit),
    /// then permanent blacklist, then any live temporary block.
    pub async fn is_allowed(&self, ip: &str) -> AccessDecision {
        if self.whitelist.contains(ip) {
            return AccessDecision::allow("Whitelisted IP");
        }

        if self.blacklist.contains_key(ip) {
            warn!(ip, "permanently blacklisted IP denied");
            return AccessDecision::deny("IP is blacklisted");
        }

        match self.read_temp_block(ip).await {
            Some(block) => {
                warn!(ip, reason = %block.reason, "temporarily blocked IP denied");
                AccessDecision::deny(block.reason)
            }
            None => AccessDecision::allow("Not blocked"),
        }
    }

    /// Returns `true` if the IP would currently be denied.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        !self.is_allowed(ip).await.allowed
    }

    /// Returns `true` if the IP bypasses all admission checks.
    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }

    /// Imposes a temporary block for `duration_minutes`, overwriting any
    /// existing block for the same IP.
    ///
    /// A storage failure is logged, never raised: the caller's request is
    /// not the one being blocked.
    pub async fn block_temporarily(&self, ip: &str, duration_minutes: u64, reason: &str) {
        let now = unix_now();
        let block = TempBlock {
            ip: ip.to_owned(),
            blocked_at: now,
            expires_at: now + duration_minutes * 60,
            reason: reason.to_owned(),
        };

        let payload = match serde_json::to_string(&block) {
            Ok(payload) => payload,
            Err(e) => {
                error!(ip, %e, "failed to encode temporary block");
                return;
            }
        };

        let ttl = Duration::from_secs(duration_minutes * 60);
        match self.store.set_with_expiry(&block_key(ip), &payload, ttl).await {
            Ok(()) => warn!(ip, duration_minutes, reason, "temporarily blocked IP"),
            Err(e) => error!(ip, %e, "failed to persist temporary block"),
        }
    }

    /// Adds an IP to the permanent blacklist.
    pub fn add_to_blacklist(&self, ip: &str, reason: &str) {
        error!(ip, reason, "permanently blacklisted IP");
        self.blacklist.insert(
            ip.to_owned(),
            BlacklistEntry {
                reason: reason.to_owned(),
                added_at: unix_now(),
            },
        );
    }

    /// Removes an IP from the permanent blacklist, also clearing any
    /// coexisting temporary block.
    pub async fn remove_from_blacklist(&self, ip: &str) {
        self.blacklist.remove(ip);
        if let Err(e) = self.store.delete(&[block_key(ip).as_str()]).await {
            warn!(ip, %e, "failed to clear temporary block on unblacklist");
        }
        info!(ip, "removed IP from blacklist");
    }

    /// Adds an IP to the whitelist.
    pub fn add_to_whitelist(&self, ip: &str) {
        self.whitelist.insert(ip.to_owned());
        info!(ip, "added IP to whitelist");
    }

    /// Removes an IP from the whitelist.
    pub fn remove_from_whitelist(&self, ip: &str) {
        self.whitelist.remove(ip);
        info!(ip, "removed IP from whitelist");
    }

    /// Records an advisory suspicious-pattern marker for the IP.
    ///
    /// Best-effort: the write happens on a detached task and may be dropped;
    /// callers never wait on it.
    pub fn mark_suspicious(&self, ip: &str, pattern: &str) {
        warn!(ip, pattern, "marked IP as suspicious");

        let store = self.store.clone();
        let key = suspicious_key(ip);
        let payload = serde_json::json!({
            "pattern": pattern,
            "detected_at": unix_now(),
        })
        .to_string();

        tokio::spawn(async move {
            if let Err(e) = store
                .set_with_expiry(&key, &payload, SUSPICIOUS_MARKER_TTL)
                .await
            {
                debug!(%e, "dropped suspicious-pattern marker");
            }
        });
    }

    /// Returns the stored human-readable block information for a
    /// blacklisted or temporarily blocked IP.
    pub async fn get_block_info(&self, ip: &str) -> Option<String> {
        if let Some(entry) = self.blacklist.get(ip) {
            return Some(format!(
                "blocked_at:{},reason:{}",
                entry.added_at, entry.reason
            ));
        }

        self.read_temp_block(ip).await.map(|block| {
            format!(
                "blocked_at:{},expires_at:{},reason:{}",
                block.blocked_at, block.expires_at, block.reason
            )
        })
    }

    /// Reads the live temporary block for `ip`, independently verifying
    /// freshness so backend eviction lag never extends a block.
    ///
    /// Any storage or decode failure fails open.
    async fn read_temp_block(&self, ip: &str) -> Option<TempBlock> {
        let raw = match self.store.get(&block_key(ip)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(ip, %e, "failed to read block state, failing open");
                return None;
            }
        };

        match serde_json::from_str::<TempBlock>(&raw) {
            Ok(block) if block.expires_at > unix_now() => Some(block),
            Ok(_) => None,
            Err(e) => {
                warn!(ip, %e, "discarding undecodable block entry");
                None
            }
        }
    }
}
