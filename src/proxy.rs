//! Per-request proxy pipeline.
//!
//! Order of operations for each inbound request:
//!
//! 1. **Exempt-path bypass** — configured prefixes (health checks) skip
//!    admission control entirely; the core is never invoked for them.
//! 2. **Identity resolution** — the canonical client identity is derived
//!    from forwarding headers, falling back to the peer socket address.
//! 3. **Admission** — registry check, then rate-limit check. A denial
//!    short-circuits into a 429 carrying the `X-RateLimit-*` headers.
//! 4. **Management surface** — `/admin/security/*` requests (themselves
//!    subject to admission) are answered locally.
//! 5. **Forwarding** — hop-by-hop stripping, `X-Forwarded-*` injection,
//!    host/URI rewrite, then the upstream round-trip under a timeout with
//!    passive health bookkeeping.
//! 6. **Feedback** — once the upstream status is known it is handed to the
//!    pattern detector on a detached task and logged as a security event.
//!
//! Every request is assigned a monotonically increasing ID and wrapped in a
//! [`tracing::Span`] carrying structured fields for observability.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info, warn};

use crate::admission::{AdmissionControl, Verdict};
use crate::config::RuntimeConfig;
use crate::upstream::UpstreamPool;
use crate::{GatewayError, Result, admin, headers};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both request forwarding and response streaming.
///
/// Uses a trait-object error type so that both `Incoming` (which yields
/// `hyper::Error`) and locally constructed bodies (which are infallible)
/// can be erased into the same type without lossy conversions.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// The HTTP client type for upstream connections.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Constructs the upstream [`HttpClient`] with the configured connect
/// timeout.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Processes a single inbound request through the gateway pipeline.
pub async fn handle_request<B>(
    req: Request<B>,
    client: HttpClient,
    config: Arc<RuntimeConfig>,
    pool: UpstreamPool,
    admission: AdmissionControl,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let uri = req.uri().clone();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        let path = uri.path();

        if config.is_exempt_path(path) {
            debug!("exempt path, bypassing admission control");
            return forward(req, client, &config, &pool, client_addr).await;
        }

        let identity = headers::resolve_client_identity(req.headers(), client_addr);

        match admission.admit(&identity, path, method.as_str()).await {
            Verdict::Allowed => {}
            Verdict::Blocked { reason } => return Err(GatewayError::Blocked { reason }),
            Verdict::Limited { reason } => return Err(GatewayError::RateLimited { reason }),
        }

        if path.starts_with(admin::ADMIN_PREFIX) {
            return admin::handle(&req, &config, &admission).await;
        }

        let result = forward(req, client, &config, &pool, client_addr).await;

        if let Ok(resp) = &result {
            let status = resp.status().as_u16();
            log_security_event(&identity, method.as_str(), path, status);

            // Detector feedback must never delay the response.
            let admission = admission.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                admission.observe_response(&identity, status).await;
            });
        }

        result
    }
    .instrument(span)
    .await
}

/// Forwards the request to the next healthy upstream and relays its
/// response, recording passive health outcomes either way.
async fn forward<B>(
    req: Request<B>,
    client: HttpClient,
    config: &RuntimeConfig,
    pool: &UpstreamPool,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let upstream = pool.next()?;
    let target = upstream.uri().clone();

    let rewritten_uri = rewrite_uri(req.uri(), &target)?;
    let (mut parts, body) = req.into_parts();

    headers::strip_hop_by_hop(&mut parts.headers);
    headers::inject_forwarding_headers(&mut parts.headers, client_addr);
    headers::rewrite_host(
        &mut parts.headers,
        target
            .authority()
            .ok_or_else(|| GatewayError::InvalidUpstream("upstream has no authority".into()))?,
    );
    parts.uri = rewritten_uri;

    debug!(upstream = %target, upstream_uri = %parts.uri, "forwarding request");

    let start = std::time::Instant::now();
    let proxy_req = Request::from_parts(parts, body.map_err(|e| e.into()).boxed());

    let mut upstream_resp = match timeout(config.request_timeout, client.request(proxy_req)).await
    {
        Ok(Ok(resp)) => {
            upstream.record_success();
            resp
        }
        Ok(Err(e)) => {
            let transitioned = upstream.record_failure(config.failure_threshold);
            warn!(
                error = %e,
                latency_ms = start.elapsed().as_millis() as u64,
                upstream = %target,
                marked_unhealthy = transitioned,
                "upstream request failed"
            );
            return Err(GatewayError::Upstream(e.to_string()));
        }
        Err(_elapsed) => {
            let transitioned = upstream.record_failure(config.failure_threshold);
            warn!(
                timeout = ?config.request_timeout,
                upstream = %target,
                marked_unhealthy = transitioned,
                "upstream request timed out"
            );
            return Err(GatewayError::Timeout(config.request_timeout));
        }
    };

    info!(
        status = upstream_resp.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        upstream = %target,
        "upstream responded"
    );

    headers::strip_hop_by_hop(upstream_resp.headers_mut());

    Ok(upstream_resp.map(|b| b.map_err(|e| -> StdError { Box::new(e) }).boxed()))
}

/// Rewrites the original request URI to target the selected upstream,
/// preserving the path and query string.
fn rewrite_uri(original: &Uri, upstream: &Uri) -> Result<Uri> {
    let authority = upstream
        .authority()
        .ok_or_else(|| GatewayError::InvalidUpstream("upstream has no authority".into()))?;

    let scheme = upstream
        .scheme()
        .ok_or_else(|| GatewayError::InvalidUpstream("upstream has no scheme".into()))?;

    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build upstream URI: {e}")))
}

/// Mirrors the upstream status into the security log: 429s and server
/// errors at elevated levels, other client errors informationally.
fn log_security_event(identity: &str, method: &str, path: &str, status: u16) {
    match status {
        429 => warn!(client = identity, method, path, status, "rate limited response"),
        400..=499 => info!(client = identity, method, path, status, "client error response"),
        500.. => error!(client = identity, method, path, status, "server error response"),
        _ => {}
    }
}
