//! Upstream pool with round-robin selection and passive health tracking.
//!
//! Each backend carries lock-free health state: a consecutive-failure
//! counter and a healthy flag, updated from request outcomes in the proxy
//! pipeline. Selection walks the pool round-robin and skips backends
//! currently marked unhealthy; a backend recovers as soon as a request to
//! it succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::{GatewayError, Result};

/// The full set of upstream backends, shared across request handlers.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    backends: Vec<Upstream>,
    cursor: AtomicUsize,
}

/// Runtime state for a single upstream backend.
#[derive(Debug, Clone)]
pub struct Upstream {
    state: Arc<UpstreamState>,
}

#[derive(Debug)]
struct UpstreamState {
    uri: hyper::Uri,
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

impl UpstreamPool {
    /// Builds a pool from validated upstream URIs, all initially healthy.
    pub fn new(uris: &[hyper::Uri]) -> Self {
        let backends = uris
            .iter()
            .map(|uri| Upstream {
                state: Arc::new(UpstreamState {
                    uri: uri.clone(),
                    consecutive_failures: AtomicU32::new(0),
                    healthy: AtomicBool::new(true),
                }),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                backends,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Selects the next healthy backend round-robin.
    ///
    /// Walks at most one full rotation; with every backend unhealthy,
    /// returns [`GatewayError::NoHealthyUpstream`].
    pub fn next(&self) -> Result<Upstream> {
        let backends = &self.inner.backends;
        if backends.is_empty() {
            return Err(GatewayError::NoHealthyUpstream);
        }

        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        (0..backends.len())
            .map(|offset| &backends[(start + offset) % backends.len()])
            .find(|backend| backend.is_healthy())
            .cloned()
            .ok_or(GatewayError::NoHealthyUpstream)
    }

    /// All backends, healthy or not.
    pub fn all(&self) -> &[Upstream] {
        &self.inner.backends
    }

    /// Number of configured backends.
    pub fn len(&self) -> usize {
        self.inner.backends.len()
    }

    /// Returns `true` if no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.inner.backends.is_empty()
    }
}

impl Upstream {
    /// The backend base URI.
    pub fn uri(&self) -> &hyper::Uri {
        &self.state.uri
    }

    /// Whether this backend is currently considered healthy.
    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::Acquire)
    }

    /// Records a successful round-trip, resetting the failure counter and
    /// marking the backend healthy.
    pub fn record_success(&self) {
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.healthy.store(true, Ordering::Release);
    }

    /// Records a failed round-trip. Reaching `threshold` consecutive
    /// failures marks the backend unhealthy; returns `true` exactly when
    /// this call caused the healthy-to-unhealthy transition.
    pub fn record_failure(&self, threshold: u32) -> bool {
        let failures = self
            .state
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        failures >= threshold && self.state.healthy.swap(false, Ordering::AcqRel)
    }

    /// Current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.state.consecutive_failures.load(Ordering::Acquire)
    }
}
