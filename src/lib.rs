//!
//! An HTTP reverse proxy with an inline admission-control layer, built on
//! [Hyper].
//!
//! Every inbound request is gated before it reaches any upstream: the
//! [`registry::AccessRegistry`] answers whether the client identity is
//! whitelisted, blacklisted, or temporarily blocked; the
//! [`engine::RateLimitEngine`] evaluates it against per-second, per-minute,
//! per-hour, per-day, and burst windows; and after each response the
//! [`detector::PatternDetector`] updates per-client risk state from the
//! observed status code. All counters live behind the
//! [`store::CounterStore`], which is either process-local or shared via
//! redis with identical semantics.
//!
//! [Hyper]: https://hyper.rs/

pub mod admin;
pub mod admission;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod store;
pub mod upstream;

pub use admission::{AccessDecision, AdmissionControl, Verdict};
pub use config::{AdmissionConfig, Config, RuntimeConfig, StoreConfig, StoreKind, TimeoutsConfig};
pub use detector::PatternDetector;
pub use engine::RateLimitEngine;
pub use error::GatewayError;
pub use proxy::{BoxBody, HttpClient, build_client, handle_request};
pub use registry::{AccessRegistry, TempBlock};
pub use server::ServerState;
pub use store::{CounterStore, LocalStore, SharedStore};
pub use upstream::{Upstream, UpstreamPool};

/// Convenience alias for results carrying a [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;
