//! Error types and HTTP status code mapping.
//!
//! Admission denials (`Blocked`, `RateLimited`) map to `429 Too Many
//! Requests` and carry the `X-RateLimit-*` headers that management tooling
//! and downstream proxies key off. Internal store failures never surface
//! here: the affected check fails open and the error is only logged.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use crate::proxy::BoxBody;
use crate::store::unix_now;

/// Seconds a rate-limited client is told to wait before retrying.
pub const RETRY_AFTER_LIMITED_SECS: u64 = 60;

/// Seconds a blocked client is told to wait before retrying.
pub const RETRY_AFTER_BLOCKED_SECS: u64 = 900;

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum GatewayError {
    /// The configuration file could not be loaded, parsed, or validated.
    Config(String),
    /// An upstream target URI is malformed or unusable.
    InvalidUpstream(String),
    /// Every configured upstream is currently marked unhealthy.
    NoHealthyUpstream,
    /// The client identity is blacklisted or temporarily blocked.
    Blocked {
        /// Human-readable reason recorded with the block.
        reason: String,
    },
    /// The request exceeded one of the configured rate-limit windows.
    RateLimited {
        /// Which window was exceeded.
        reason: String,
    },
    /// The in-flight request limit was reached.
    ServiceUnavailable {
        /// The configured concurrency limit, echoed in the response.
        limit: usize,
    },
    /// The upstream request failed or the upstream was unreachable.
    Upstream(String),
    /// The upstream round-trip exceeded the configured request timeout.
    Timeout(Duration),
    /// A counter-store operation failed. Never reaches a client response:
    /// callers on the request path fail open instead of propagating this.
    Store(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidUpstream(msg) => write!(f, "invalid upstream: {msg}"),
            Self::NoHealthyUpstream => write!(f, "no healthy upstream available"),
            Self::Blocked { reason } => write!(f, "access blocked: {reason}"),
            Self::RateLimited { reason } => write!(f, "rate limited: {reason}"),
            Self::ServiceUnavailable { limit } => {
                write!(f, "concurrency limit of {limit} in-flight requests reached")
            }
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Timeout(d) => write!(f, "upstream request timed out after {d:?}"),
            Self::Store(msg) => write!(f, "counter store error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Machine-readable code used in JSON error bodies.
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidUpstream(_) => "invalid_upstream",
            Self::NoHealthyUpstream => "no_healthy_upstream",
            Self::Blocked { .. } | Self::RateLimited { .. } => "too_many_requests",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Upstream(_) => "upstream_error",
            Self::Timeout(_) => "upstream_timeout",
            Self::Store(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) | Self::InvalidUpstream(_) | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Blocked { .. } | Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoHealthyUpstream | Self::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    ///
    /// Admission denials additionally carry the compatibility headers:
    /// `X-RateLimit-Blocked: true` with `Retry-After: 900` for blocks, and
    /// `X-RateLimit-Limited: true` with `Retry-After: 60` for rate limits,
    /// plus `X-RateLimit-Reason` in both cases.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "application/json");

        let body = match &self {
            Self::Blocked { reason } => {
                builder = builder
                    .header("x-ratelimit-blocked", "true")
                    .header("x-ratelimit-reason", sanitize_header(reason))
                    .header("retry-after", RETRY_AFTER_BLOCKED_SECS.to_string());
                serde_json::json!({
                    "error": "Too Many Requests",
                    "message": reason,
                    "status": status.as_u16(),
                    "timestamp": unix_now(),
                })
            }
            Self::RateLimited { reason } => {
                builder = builder
                    .header("x-ratelimit-limited", "true")
                    .header("x-ratelimit-reason", sanitize_header(reason))
                    .header("retry-after", RETRY_AFTER_LIMITED_SECS.to_string());
                serde_json::json!({
                    "error": "Rate Limit Exceeded",
                    "message": reason,
                    "status": status.as_u16(),
                    "timestamp": unix_now(),
                })
            }
            _ => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        builder
            .body(full_body(body.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full_body(String::new()))
                    .expect("building fallback response must not fail")
            })
    }
}

/// Wraps a string in a type-erased, infallible response body.
pub(crate) fn full_body(data: String) -> BoxBody {
    Full::new(Bytes::from(data))
        .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
        .boxed()
}

/// Header values must be visible ASCII; anything else is replaced so the
/// reason always round-trips through the `X-RateLimit-Reason` header.
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_response_carries_compat_headers() {
        let err = GatewayError::Blocked {
            reason: "IP is blacklisted".into(),
        };
        let resp = err.into_response();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-ratelimit-blocked"], "true");
        assert_eq!(resp.headers()["x-ratelimit-reason"], "IP is blacklisted");
        assert_eq!(resp.headers()["retry-after"], "900");
        assert!(!resp.headers().contains_key("x-ratelimit-limited"));
    }

    #[test]
    fn rate_limited_response_carries_compat_headers() {
        let err = GatewayError::RateLimited {
            reason: "Rate limit exceeded (per minute)".into(),
        };
        let resp = err.into_response();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-ratelimit-limited"], "true");
        assert_eq!(resp.headers()["retry-after"], "60");
        assert!(!resp.headers().contains_key("x-ratelimit-blocked"));
    }

    #[test]
    fn upstream_error_maps_to_bad_gateway() {
        let err = GatewayError::Upstream("connection refused".into());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = GatewayError::Timeout(Duration::from_secs(30));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn sanitize_replaces_non_ascii() {
        assert_eq!(sanitize_header("plain reason"), "plain reason");
        assert_eq!(sanitize_header("bad\nnewline"), "bad?newline");
    }
}
