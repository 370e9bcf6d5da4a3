//! The admission control facade wired in front of the proxy pipeline.
//!
//! Combines the [`AccessRegistry`], [`RateLimitEngine`], and
//! [`PatternDetector`] behind the two entry points the proxy layer calls:
//! [`AdmissionControl::admit`] before forwarding and
//! [`AdmissionControl::observe_response`] once the upstream status is
//! known. Constructed once at startup and passed by handle; there is no
//! implicit global instance.

use std::sync::Arc;

use tracing::warn;

use crate::config::AdmissionConfig;
use crate::detector::PatternDetector;
use crate::engine::RateLimitEngine;
use crate::registry::AccessRegistry;
use crate::store::CounterStore;

/// The allow/deny result of a single gating check.
///
/// Produced by both the registry and the rate limit engine; the first
/// `allowed = false` short-circuits the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Human-readable explanation of the verdict.
    pub reason: String,
}

impl AccessDecision {
    /// An allowing decision.
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    /// A denying decision.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// The overall admission verdict for one request, distinguishing which
/// tier denied it so the proxy can shape the client-facing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Both tiers passed; the request may be forwarded.
    Allowed,
    /// Denied by the access registry (blacklist or temporary block).
    Blocked {
        /// Reason recorded with the block.
        reason: String,
    },
    /// Denied by the rate limit engine.
    Limited {
        /// Which window was exceeded.
        reason: String,
    },
}

/// The admission control engine: one instance per process, shared across
/// all request handlers.
///
/// Cheap to clone; clones share all underlying state.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    registry: Arc<AccessRegistry>,
    engine: RateLimitEngine,
    detector: PatternDetector,
}

impl AdmissionControl {
    /// Wires up the registry, engine, and detector over one store.
    pub fn new(store: CounterStore, config: Arc<AdmissionConfig>) -> Self {
        let registry = Arc::new(AccessRegistry::new(store.clone(), &config));
        let engine = RateLimitEngine::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&config),
        );
        let detector = PatternDetector::new(store, Arc::clone(&registry), config);

        Self {
            registry,
            engine,
            detector,
        }
    }

    /// The registry handle, for the management surface and startup seeding.
    pub fn registry(&self) -> &Arc<AccessRegistry> {
        &self.registry
    }

    /// Decides whether a request from `client_ip` may proceed.
    ///
    /// Registry first (blacklist / temporary block), then the rate limit
    /// windows; the first denial wins and is logged as a security event.
    pub async fn admit(&self, client_ip: &str, path: &str, method: &str) -> Verdict {
        let gate = self.registry.is_allowed(client_ip).await;
        if !gate.allowed {
            warn!(
                client = client_ip,
                method,
                path,
                reason = %gate.reason,
                "request blocked"
            );
            return Verdict::Blocked {
                reason: gate.reason,
            };
        }

        let rate = self.engine.check_rate_limit(client_ip, path).await;
        if !rate.allowed {
            warn!(
                client = client_ip,
                method,
                path,
                reason = %rate.reason,
                "request rate limited"
            );
            return Verdict::Limited {
                reason: rate.reason,
            };
        }

        Verdict::Allowed
    }

    /// Feeds one completed response into the pattern detector.
    pub async fn observe_response(&self, client_ip: &str, status: u16) {
        self.detector.track_error_response(client_ip, status).await;
    }
}
