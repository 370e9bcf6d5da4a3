//! Administrative surface for inspecting and mutating admission state.
//!
//! Served from the same listener as proxied traffic, under
//! [`ADMIN_PREFIX`]. Routes mirror the management API of the original
//! gateway:
//!
//! - `GET    /admin/security/config`              — active thresholds
//! - `GET    /admin/security/ip/{ip}/status`      — block/whitelist state
//! - `POST   /admin/security/ip/{ip}/block`       — temporary block
//!   (`durationMinutes`, `reason` query parameters)
//! - `POST   /admin/security/ip/{ip}/blacklist`   — permanent blacklist
//!   (`reason` query parameter)
//! - `DELETE /admin/security/ip/{ip}/blacklist`   — remove from blacklist
//! - `POST   /admin/security/ip/{ip}/whitelist`   — add to whitelist
//! - `DELETE /admin/security/ip/{ip}/whitelist`   — remove from whitelist
//! - `GET    /admin/security/health`              — service health

use hyper::{Method, Request, Response, StatusCode, Uri};
use serde_json::json;

use crate::admission::AdmissionControl;
use crate::config::RuntimeConfig;
use crate::error::full_body;
use crate::proxy::BoxBody;
use crate::store::unix_now;
use crate::{GatewayError, Result};

/// Path prefix routed to the management surface instead of upstreams.
pub const ADMIN_PREFIX: &str = "/admin/security";

const DEFAULT_BLOCK_MINUTES: u64 = 15;
const DEFAULT_BLOCK_REASON: &str = "Manual block";
const DEFAULT_BLACKLIST_REASON: &str = "Manual blacklist";

/// Dispatches one management request. The request body is never read;
/// every mutation is parameterized through the path and query string.
pub async fn handle<B>(
    req: &Request<B>,
    config: &RuntimeConfig,
    admission: &AdmissionControl,
) -> Result<Response<BoxBody>> {
    let path = req.uri().path();
    let rest = path.strip_prefix(ADMIN_PREFIX).unwrap_or(path);
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let registry = admission.registry();

    match (req.method(), segments.as_slice()) {
        (&Method::GET, ["config"]) => {
            let a = &config.admission;
            json_response(
                StatusCode::OK,
                json!({
                    "requestsPerMinute": a.requests_per_minute,
                    "requestsPerHour": a.requests_per_hour,
                    "requestsPerDay": a.requests_per_day,
                    "burstCapacity": a.burst_capacity,
                    "ddosThresholdPerSecond": a.ddos_threshold_per_second,
                    "ddosThresholdPerMinute": a.ddos_threshold_per_minute,
                    "ddosBlockDurationMinutes": a.ddos_block_duration_minutes,
                    "maxConsecutiveErrors": a.max_consecutive_errors,
                    "maxSameEndpointRequests": a.max_same_endpoint_requests,
                    "suspiciousBlockMinutes": a.suspicious_block_minutes,
                    "exemptPaths": a.exempt_paths,
                }),
            )
        }

        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            json!({
                "status": "UP",
                "service": "DDoS Protection",
                "timestamp": unix_now(),
            }),
        ),

        (&Method::GET, ["ip", ip, "status"]) => {
            let blocked = registry.is_blocked(ip).await;
            let mut status = json!({
                "ip": ip,
                "blocked": blocked,
                "whitelisted": registry.is_whitelisted(ip),
            });
            if blocked {
                if let Some(info) = registry.get_block_info(ip).await {
                    status["blockInfo"] = json!(info);
                }
            }
            json_response(StatusCode::OK, status)
        }

        (&Method::POST, ["ip", ip, "block"]) => {
            let duration = query_param(req.uri(), "durationMinutes")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_BLOCK_MINUTES);
            let reason =
                query_param(req.uri(), "reason").unwrap_or_else(|| DEFAULT_BLOCK_REASON.into());

            registry.block_temporarily(ip, duration, &reason).await;

            json_response(
                StatusCode::OK,
                json!({
                    "message": "IP blocked successfully",
                    "ip": ip,
                    "duration": format!("{duration} minutes"),
                    "reason": reason,
                }),
            )
        }

        (&Method::POST, ["ip", ip, "blacklist"]) => {
            let reason = query_param(req.uri(), "reason")
                .unwrap_or_else(|| DEFAULT_BLACKLIST_REASON.into());

            registry.add_to_blacklist(ip, &reason);

            json_response(
                StatusCode::OK,
                json!({
                    "message": "IP permanently blacklisted",
                    "ip": ip,
                    "reason": reason,
                }),
            )
        }

        (&Method::DELETE, ["ip", ip, "blacklist"]) => {
            registry.remove_from_blacklist(ip).await;
            json_response(
                StatusCode::OK,
                json!({
                    "message": "IP removed from blacklist",
                    "ip": ip,
                }),
            )
        }

        (&Method::POST, ["ip", ip, "whitelist"]) => {
            registry.add_to_whitelist(ip);
            json_response(
                StatusCode::OK,
                json!({
                    "message": "IP added to whitelist",
                    "ip": ip,
                }),
            )
        }

        (&Method::DELETE, ["ip", ip, "whitelist"]) => {
            registry.remove_from_whitelist(ip);
            json_response(
                StatusCode::OK,
                json!({
                    "message": "IP removed from whitelist",
                    "ip": ip,
                }),
            )
        }

        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "not_found",
                "message": format!("no management route for {path}"),
            }),
        ),
    }
}

/// Extracts a single query parameter value, verbatim.
fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Result<Response<BoxBody>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .map_err(|e| GatewayError::Internal(format!("failed to build admin response: {e}")))
}
