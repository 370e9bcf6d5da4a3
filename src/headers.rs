//! HTTP header processing: hop-by-hop removal, forwarding header injection,
//! host rewriting, and client identity resolution.
//!
//! Implements the header-level requirements of RFC 7230 Section 6.1
//! (hop-by-hop header handling) and the de-facto `X-Forwarded-*` convention
//! for reverse proxies.

use std::net::{IpAddr, SocketAddr};

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// Sentinel identity used when a forwarding header is present but does not
/// carry a parseable address. Admission state for such clients pools under
/// one key rather than crashing or bypassing the pipeline.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Forwarding headers consulted for the original client address, in
/// precedence order.
const IDENTITY_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Resolves the canonical client identity for admission keying.
///
/// Walks `X-Forwarded-For` (first entry), `X-Real-IP`, and
/// `CF-Connecting-IP` in that order; the first header that is present and
/// non-empty decides. A candidate that does not parse as an IP address
/// resolves to [`UNKNOWN_IDENTITY`]. With no forwarding headers at all, the
/// peer socket address is used.
pub fn resolve_client_identity(headers: &HeaderMap, remote: SocketAddr) -> String {
    for name in IDENTITY_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let candidate = value.split(',').next().unwrap_or_default().trim();
        if candidate.is_empty() {
            continue;
        }
        return match candidate.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => UNKNOWN_IDENTITY.to_owned(),
        };
    }

    remote.ip().to_string()
}

/// Removes all hop-by-hop headers from the given header map.
///
/// Strips the standard set defined in RFC 7230 Section 6.1 (`Connection`,
/// `Keep-Alive`, `Proxy-Authenticate`, `Proxy-Authorization`, `TE`,
/// `Trailers`, `Transfer-Encoding`, `Upgrade`), plus any additional
/// header names declared in the `Connection` header value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let conn: Vec<HeaderName> = headers
        .get("connection")
        .and_then(|val| val.to_str().ok())
        .map(|val| {
            val.split(',')
                .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
                .collect()
        })
        .unwrap_or_default();

    conn.iter().for_each(|name| {
        headers.remove(name);
    });

    [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ]
    .iter()
    .for_each(|name| {
        headers.remove(*name);
    });
}

/// Injects `X-Forwarded-For`, `X-Forwarded-Proto`, and `X-Forwarded-Host`
/// headers into the given header map.
///
/// - `X-Forwarded-For` is appended to any existing value (preserving upstream
///   proxy chains) with the client's socket address.
/// - `X-Forwarded-Proto` is set to `"http"`.
/// - `X-Forwarded-Host` is set to the original `Host` header value, if present.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();

    let xff_value = headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or_else(|| client_ip);

    if let Ok(val) = HeaderValue::from_str(&xff_value) {
        headers.insert("x-forwarded-for", val);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = headers.get(hyper::header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
}

/// Rewrites the `Host` header to match the upstream authority.
///
/// This ensures the upstream server receives the correct `Host` value
/// regardless of what the client originally sent.
pub fn rewrite_host(headers: &mut HeaderMap, upstream_auth: &Authority) {
    if let Ok(val) = HeaderValue::from_str(upstream_auth.as_str()) {
        headers.insert(hyper::header::HOST, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .fold(HeaderMap::new(), |mut map, (name, value)| {
                map.insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
                map
            })
    }

    fn remote() -> SocketAddr {
        "192.168.1.10:5000".parse().unwrap()
    }

    #[test]
    fn identity_from_forwarded_for_first_entry() {
        let headers = header_map(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(resolve_client_identity(&headers, remote()), "203.0.113.7");
    }

    #[test]
    fn identity_from_real_ip_when_no_forwarded_for() {
        let headers = header_map(&[("x-real-ip", "203.0.113.8")]);
        assert_eq!(resolve_client_identity(&headers, remote()), "203.0.113.8");
    }

    #[test]
    fn identity_from_cloudflare_header() {
        let headers = header_map(&[("cf-connecting-ip", "2001:db8::1")]);
        assert_eq!(resolve_client_identity(&headers, remote()), "2001:db8::1");
    }

    #[test]
    fn forwarded_for_takes_precedence_over_real_ip() {
        let headers = header_map(&[
            ("x-real-ip", "203.0.113.8"),
            ("x-forwarded-for", "203.0.113.7"),
        ]);
        assert_eq!(resolve_client_identity(&headers, remote()), "203.0.113.7");
    }

    #[test]
    fn identity_falls_back_to_socket_address() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_client_identity(&headers, remote()), "192.168.1.10");
    }

    #[test]
    fn empty_forwarded_for_falls_through_to_next_header() {
        let headers = header_map(&[("x-forwarded-for", ""), ("x-real-ip", "203.0.113.8")]);
        assert_eq!(resolve_client_identity(&headers, remote()), "203.0.113.8");
    }

    #[test]
    fn unparseable_identity_uses_the_sentinel() {
        let headers = header_map(&[("x-forwarded-for", "not-an-address")]);
        assert_eq!(resolve_client_identity(&headers, remote()), UNKNOWN_IDENTITY);
    }

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut headers = header_map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("x-custom", "preserved"),
        ]);

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));

        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn strips_connection_declared_headers() {
        let mut headers = header_map(&[
            ("connection", "x-secret-internal, x-debug-token"),
            ("x-secret-internal", "leaked"),
            ("x-debug-token", "abc"),
            ("x-safe", "keep"),
        ]);

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("x-secret-internal"));
        assert!(!headers.contains_key("x-debug-token"));
        assert!(!headers.contains_key("connection"));

        assert!(headers.contains_key("x-safe"));
    }

    #[test]
    fn injects_xff_with_no_prior_value() {
        let mut headers = HeaderMap::new();

        inject_forwarding_headers(&mut headers, remote());

        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "192.168.1.10"
        );
    }

    #[test]
    fn appends_to_existing_xff() {
        let mut headers = header_map(&[("x-forwarded-for", "10.0.0.1")]);

        inject_forwarding_headers(&mut headers, remote());

        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "10.0.0.1, 192.168.1.10"
        );
    }

    #[test]
    fn injects_forwarded_proto_and_host() {
        let mut headers = header_map(&[("host", "api.example.com")]);

        inject_forwarding_headers(&mut headers, remote());

        assert_eq!(
            headers.get("x-forwarded-proto").unwrap().to_str().unwrap(),
            "http"
        );
        assert_eq!(
            headers.get("x-forwarded-host").unwrap().to_str().unwrap(),
            "api.example.com"
        );
    }

    #[test]
    fn no_forwarded_host_when_host_absent() {
        let mut headers = HeaderMap::new();

        inject_forwarding_headers(&mut headers, remote());

        assert!(!headers.contains_key("x-forwarded-host"));
    }

    #[test]
    fn rewrites_host_to_upstream_authority() {
        let mut headers = header_map(&[("host", "client-facing.com")]);
        let authority = "backend.internal:3000".parse::<Authority>().unwrap();

        rewrite_host(&mut headers, &authority);

        assert_eq!(
            headers.get("host").unwrap().to_str().unwrap(),
            "backend.internal:3000"
        );
    }
}
