//! Integration tests for the full request pipeline.
//!
//! Drives `handle_request` end to end against throwaway backends and
//! verifies the admission surface a client actually sees: pass-through for
//! clean traffic, 429 responses with the `X-RateLimit-*` headers for
//! blocked and rate-limited clients, exempt-path bypass, forwarding
//! headers, and post-response escalation from observed error statuses.

mod common;

use std::time::Duration;

use common::*;
use gatehouse::AdmissionConfig;
use hyper::StatusCode;

#[tokio::test]
async fn allowed_request_reaches_upstream() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(addr, lenient_admission());
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    let resp = send_request("/api/users", &config, &pool, &admission)
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&collect_body(resp.into_body()).await[..], b"ok");
}

#[tokio::test]
async fn blacklisted_client_receives_429_with_block_headers() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(addr, lenient_admission());
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    admission.registry().add_to_blacklist(TEST_CLIENT_IP, "abuse");

    let err = send_request("/api/users", &config, &pool, &admission)
        .await
        .unwrap_err();
    let resp = err.into_response();

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["x-ratelimit-blocked"], "true");
    assert_eq!(resp.headers()["x-ratelimit-reason"], "IP is blacklisted");
    assert_eq!(resp.headers()["retry-after"], "900");
}

#[tokio::test]
async fn minute_limit_produces_429_with_limited_headers() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(
        addr,
        AdmissionConfig {
            requests_per_minute: 2,
            ..lenient_admission()
        },
    );
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    for _ in 0..2 {
        let resp = send_request("/api/users", &config, &pool, &admission)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let err = send_request("/api/users", &config, &pool, &admission)
        .await
        .unwrap_err();
    let resp = err.into_response();

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["x-ratelimit-limited"], "true");
    assert_eq!(resp.headers()["retry-after"], "60");
    let reason = resp.headers()["x-ratelimit-reason"].to_str().unwrap();
    assert!(reason.contains("minute"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn whitelisted_client_is_never_limited() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(
        addr,
        AdmissionConfig {
            requests_per_minute: 1,
            burst_capacity: 1,
            ddos_threshold_per_second: 1,
            whitelist: vec![TEST_CLIENT_IP.into()],
            ..Default::default()
        },
    );
    let (admission, store) = local_admission(&config);
    let pool = test_pool(&config);

    for _ in 0..10 {
        let resp = send_request("/api/users", &config, &pool, &admission)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // Whitelisted traffic must not contribute to any window counter.
    assert!(store.is_empty());
}

#[tokio::test]
async fn exempt_path_bypasses_admission_entirely() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "healthy").await;
    let config = test_config(addr, lenient_admission());
    let (admission, store) = local_admission(&config);
    let pool = test_pool(&config);

    admission.registry().add_to_blacklist(TEST_CLIENT_IP, "abuse");

    let resp = send_request("/health", &config, &pool, &admission)
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(store.is_empty());
}

#[tokio::test]
async fn upstream_error_statuses_escalate_to_a_block() {
    init_tracing();
    let (addr, _shutdown) =
        start_backend(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "boom").await;
    let config = test_config(
        addr,
        AdmissionConfig {
            max_consecutive_errors: 2,
            ..lenient_admission()
        },
    );
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    for _ in 0..2 {
        let resp = send_request("/api/users", &config, &pool, &admission)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The detector runs on a detached task; let each observation land.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let err = send_request("/api/users", &config, &pool, &admission)
        .await
        .unwrap_err();
    let resp = err.into_response();

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["x-ratelimit-blocked"], "true");
    assert_eq!(
        resp.headers()["x-ratelimit-reason"],
        "Too many error responses"
    );
}

#[tokio::test]
async fn ddos_burst_blocks_subsequent_requests() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(
        addr,
        AdmissionConfig {
            ddos_threshold_per_second: 1,
            ..lenient_admission()
        },
    );
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    // With a ceiling of one per second, three rapid requests must trip the
    // DDoS tier at least once even if they straddle a second boundary.
    let mut denied = 0;
    for _ in 0..3 {
        if send_request("/api/users", &config, &pool, &admission)
            .await
            .is_err()
        {
            denied += 1;
        }
    }
    assert!(denied >= 1, "expected at least one DDoS denial");

    // The escalation holds at the registry tier: the next request is
    // refused outright, not re-evaluated against fresh windows.
    let err = send_request("/api/users", &config, &pool, &admission)
        .await
        .unwrap_err();
    let resp = err.into_response();

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["x-ratelimit-blocked"], "true");
    assert_eq!(
        resp.headers()["x-ratelimit-reason"],
        "Too many requests per second"
    );
}

#[tokio::test]
async fn forwarding_headers_are_injected() {
    init_tracing();
    let (addr, _shutdown) = start_echo_headers_backend().await;
    let config = test_config(addr, lenient_admission());
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    let resp = send_request("/echo", &config, &pool, &admission)
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = collect_body(resp.into_body()).await;
    let body = String::from_utf8_lossy(&body);

    assert!(body.contains(&format!("x-forwarded-for: {TEST_CLIENT_IP}")));
    assert!(body.contains("x-forwarded-proto: http"));
    assert!(body.contains(&format!("host: {addr}")));
}

#[tokio::test]
async fn unreachable_upstream_returns_bad_gateway() {
    init_tracing();
    // Nothing listens on port 9; the connection is refused immediately.
    let addr = "127.0.0.1:9".parse().unwrap();
    let config = test_config(addr, lenient_admission());
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    let err = send_request("/api/users", &config, &pool, &admission)
        .await
        .unwrap_err();

    assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn distinct_clients_have_independent_limits() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(
        addr,
        AdmissionConfig {
            requests_per_minute: 1,
            ..lenient_admission()
        },
    );
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    let addr_a = "10.0.0.1:12345".parse().unwrap();
    let addr_b = "10.0.0.2:12345".parse().unwrap();

    assert!(
        send_request_from("/api", &config, &pool, &admission, addr_a)
            .await
            .is_ok()
    );
    assert!(
        send_request_from("/api", &config, &pool, &admission, addr_a)
            .await
            .is_err()
    );
    assert!(
        send_request_from("/api", &config, &pool, &admission, addr_b)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn identity_comes_from_forwarding_headers() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let config = test_config(addr, lenient_admission());
    let (admission, _) = local_admission(&config);
    let pool = test_pool(&config);

    // Blacklist the *forwarded* identity, not the socket address.
    admission
        .registry()
        .add_to_blacklist("203.0.113.50", "abuse");

    let req = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri("http://gateway.test/api")
        .header("x-forwarded-for", "203.0.113.50, 10.0.0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .unwrap();

    let err = gatehouse::handle_request(
        req,
        test_client(),
        std::sync::Arc::clone(&config),
        pool.clone(),
        admission.clone(),
        test_addr(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
}
