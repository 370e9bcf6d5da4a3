//! Configuration loading and validation.
//!
//! The gateway reads its YAML configuration exactly once at startup.
//! The raw [`Config`] maps the on-disk schema; [`Config::into_runtime`]
//! validates every field into a [`RuntimeConfig`] before the server
//! accepts any traffic. A malformed threshold is fatal at startup, never
//! at request time.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{GatewayError, Result};

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";

/// Default connect timeout for establishing upstream TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total request timeout covering the entire upstream round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of concurrent in-flight requests the gateway
/// will handle before returning 503 Service Unavailable.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default number of consecutive failures before marking an upstream unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default bound on a single shared-store operation.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Default interval between local store eviction sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:8100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Upstream backend base URIs (e.g. `"http://backend1:3000"`).
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// Connect/request timeouts, in seconds.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Maximum concurrent in-flight requests before returning 503
    /// (default: 1000).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    /// Consecutive upstream failures before the backend is skipped by the
    /// round-robin (default: 3).
    #[serde(default)]
    pub upstream_failure_threshold: Option<u32>,
    /// Counter store backend selection and tuning.
    #[serde(default)]
    pub store: StoreConfig,
    /// Admission control thresholds and seed lists.
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Timeouts for the upstream round-trip, in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    /// Connect timeout for upstream TCP connections (default: 5).
    #[serde(default = "default_connect_secs")]
    pub connect: u64,
    /// Total request timeout; expiry yields 504 (default: 30).
    #[serde(default = "default_request_secs")]
    pub request: u64,
}

fn default_connect_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_request_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_secs(),
            request: default_request_secs(),
        }
    }
}

/// Which counter store backend to use.
///
/// The two backends expose identical semantics; `redis` shares admission
/// state across gateway instances while `local` keeps it in-process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process store with a periodic eviction sweep.
    #[default]
    Local,
    /// Networked redis store with native per-key TTL.
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Backend selection (default: `local`).
    #[serde(default)]
    pub kind: StoreKind,
    /// Connection URL, required when `kind` is `redis`
    /// (e.g. `"redis://127.0.0.1:6379"`).
    #[serde(default)]
    pub url: Option<String>,
    /// Upper bound on a single shared-store operation in milliseconds
    /// (default: 2000). Reads that exceed it fail open.
    #[serde(default = "default_store_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Interval between local store eviction sweeps in seconds (default: 60).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            url: None,
            operation_timeout_ms: default_store_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Admission control thresholds and seed lists.
///
/// All thresholds are inclusive ceilings: a window count equal to the limit
/// is still admitted, the first count strictly above it is denied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Requests admitted per client per minute bucket (default: 60).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Requests admitted per client per hour bucket (default: 1000).
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    /// Requests admitted per client per day bucket (default: 10000).
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u32,
    /// Requests admitted per client inside the rolling burst window
    /// (default: 10).
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,
    /// Per-second count above which the client is denied and temporarily
    /// blocked (default: 10).
    #[serde(default = "default_ddos_threshold_per_second")]
    pub ddos_threshold_per_second: u32,
    /// Reported alongside the per-second threshold on the management
    /// surface (default: 100). The per-minute escalation itself is driven
    /// by `requests_per_minute`.
    #[serde(default = "default_ddos_threshold_per_minute")]
    pub ddos_threshold_per_minute: u32,
    /// Duration of a DDoS escalation block, in minutes (default: 15).
    #[serde(default = "default_ddos_block_duration_minutes")]
    pub ddos_block_duration_minutes: u32,
    /// Error responses inside one minute bucket that trigger a temporary
    /// block (default: 10).
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Requests to a single endpoint inside one minute bucket above which
    /// the client is marked suspicious (default: 50).
    #[serde(default = "default_max_same_endpoint_requests")]
    pub max_same_endpoint_requests: u32,
    /// Duration of a suspicious-pattern block, in minutes (default: 5).
    #[serde(default = "default_suspicious_block_minutes")]
    pub suspicious_block_minutes: u32,
    /// Client identities that bypass every admission check.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Client identities denied unconditionally (unless whitelisted).
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Path prefixes for which admission control is never invoked
    /// (default: `["/health"]`).
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_requests_per_hour() -> u32 {
    1000
}

fn default_requests_per_day() -> u32 {
    10000
}

fn default_burst_capacity() -> u32 {
    10
}

fn default_ddos_threshold_per_second() -> u32 {
    10
}

fn default_ddos_threshold_per_minute() -> u32 {
    100
}

fn default_ddos_block_duration_minutes() -> u32 {
    15
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_max_same_endpoint_requests() -> u32 {
    50
}

fn default_suspicious_block_minutes() -> u32 {
    5
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".into()]
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            requests_per_day: default_requests_per_day(),
            burst_capacity: default_burst_capacity(),
            ddos_threshold_per_second: default_ddos_threshold_per_second(),
            ddos_threshold_per_minute: default_ddos_threshold_per_minute(),
            ddos_block_duration_minutes: default_ddos_block_duration_minutes(),
            max_consecutive_errors: default_max_consecutive_errors(),
            max_same_endpoint_requests: default_max_same_endpoint_requests(),
            suspicious_block_minutes: default_suspicious_block_minutes(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the gateway binds to.
    pub listen: SocketAddr,
    /// Validated upstream base URIs.
    pub upstreams: Vec<hyper::Uri>,
    /// Connect timeout for upstream TCP connections.
    pub connect_timeout: Duration,
    /// Total request timeout for the upstream round-trip. Expiry yields 504.
    pub request_timeout: Duration,
    /// Maximum concurrent in-flight requests. Overflow yields 503.
    pub max_concurrent_requests: usize,
    /// Consecutive failures before an upstream is skipped.
    pub failure_threshold: u32,
    /// Counter store selection and tuning.
    pub store: StoreConfig,
    /// Admission thresholds and seed lists.
    pub admission: AdmissionConfig,
}

/// Validates a single upstream address string into a usable URI.
fn validate_upstream(address: &str) -> Result<hyper::Uri> {
    if address.is_empty() {
        return Err(GatewayError::InvalidUpstream(
            "upstream address must not be empty".into(),
        ));
    }

    let uri = address
        .parse::<hyper::Uri>()
        .map_err(|e| GatewayError::InvalidUpstream(format!("{address}: {e}")))?;

    if uri.scheme().is_none() {
        return Err(GatewayError::InvalidUpstream(format!(
            "upstream URI has no scheme: {address}"
        )));
    }
    if uri.authority().is_none() {
        return Err(GatewayError::InvalidUpstream(format!(
            "upstream URI has no authority: {address}"
        )));
    }

    Ok(uri)
}

fn require_nonzero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(GatewayError::Config(format!("{name} must be non-zero")));
    }
    Ok(())
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    ///
    /// At least one upstream must be configured, every threshold must be
    /// non-zero, and a redis store needs a connection URL.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.upstreams.is_empty() {
            return Err(GatewayError::Config(
                "at least one upstream must be configured".into(),
            ));
        }

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            GatewayError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let upstreams = self
            .upstreams
            .iter()
            .map(|addr| validate_upstream(addr))
            .collect::<Result<Vec<_>>>()?;

        require_nonzero("timeouts.connect", self.timeouts.connect)?;
        require_nonzero("timeouts.request", self.timeouts.request)?;
        require_nonzero("store.operation_timeout_ms", self.store.operation_timeout_ms)?;
        require_nonzero("store.sweep_interval_secs", self.store.sweep_interval_secs)?;

        if self.store.kind == StoreKind::Redis && self.store.url.is_none() {
            return Err(GatewayError::Config(
                "store.url is required when store.kind is redis".into(),
            ));
        }

        let a = &self.admission;
        require_nonzero("admission.requests_per_minute", a.requests_per_minute.into())?;
        require_nonzero("admission.requests_per_hour", a.requests_per_hour.into())?;
        require_nonzero("admission.requests_per_day", a.requests_per_day.into())?;
        require_nonzero("admission.burst_capacity", a.burst_capacity.into())?;
        require_nonzero(
            "admission.ddos_threshold_per_second",
            a.ddos_threshold_per_second.into(),
        )?;
        require_nonzero(
            "admission.ddos_threshold_per_minute",
            a.ddos_threshold_per_minute.into(),
        )?;
        require_nonzero(
            "admission.ddos_block_duration_minutes",
            a.ddos_block_duration_minutes.into(),
        )?;
        require_nonzero(
            "admission.max_consecutive_errors",
            a.max_consecutive_errors.into(),
        )?;
        require_nonzero(
            "admission.max_same_endpoint_requests",
            a.max_same_endpoint_requests.into(),
        )?;
        require_nonzero(
            "admission.suspicious_block_minutes",
            a.suspicious_block_minutes.into(),
        )?;

        Ok(RuntimeConfig {
            listen,
            upstreams,
            connect_timeout: Duration::from_secs(self.timeouts.connect),
            request_timeout: Duration::from_secs(self.timeouts.request),
            max_concurrent_requests: self
                .max_concurrent_requests
                .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
            failure_threshold: self
                .upstream_failure_threshold
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            store: self.store,
            admission: self.admission,
        })
    }
}

impl RuntimeConfig {
    /// Returns `true` if the given request path is exempt from admission
    /// control (prefix match).
    pub fn is_exempt_path(&self, path: &str) -> bool {
        self.admission
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}
