//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backend servers, configuration builders, and
//! admission-control constructors used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use gatehouse::{
    AdmissionConfig, AdmissionControl, BoxBody, Config, CounterStore, HttpClient, LocalStore,
    RuntimeConfig, UpstreamPool,
};

/// A synthetic client address used in all test invocations.
pub const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// The IP portion of [`TEST_CLIENT_ADDR`], as admission control sees it.
pub const TEST_CLIENT_IP: &str = "192.168.1.100";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .build(hyper_util::client::legacy::connect::HttpConnector::new())
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Collects a [`BoxBody`] and parses it as JSON.
pub async fn collect_json(body: BoxBody) -> serde_json::Value {
    let bytes = collect_body(body).await;
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}

/// Admission ceilings high enough to stay out of the way unless a test
/// lowers one.
pub fn lenient_admission() -> AdmissionConfig {
    AdmissionConfig {
        requests_per_minute: 10_000,
        requests_per_hour: 100_000,
        requests_per_day: 1_000_000,
        burst_capacity: 10_000,
        ddos_threshold_per_second: 10_000,
        max_same_endpoint_requests: 10_000,
        max_consecutive_errors: 10_000,
        ..Default::default()
    }
}

/// Builds a `RuntimeConfig` targeting the given local backend address.
pub fn test_config(addr: SocketAddr, admission: AdmissionConfig) -> Arc<RuntimeConfig> {
    Arc::new(
        Config {
            upstreams: vec![format!("http://{addr}")],
            admission,
            ..Default::default()
        }
        .into_runtime()
        .expect("test config must be valid"),
    )
}

/// Builds an [`AdmissionControl`] over a fresh local store, returning the
/// store handle so tests can inspect raw counter state.
pub fn local_admission(config: &RuntimeConfig) -> (AdmissionControl, LocalStore) {
    let local = LocalStore::new();
    let admission = AdmissionControl::new(
        CounterStore::Local(local.clone()),
        Arc::new(config.admission.clone()),
    );
    (admission, local)
}

/// Builds an [`UpstreamPool`] over the upstream(s) in the given config.
pub fn test_pool(config: &RuntimeConfig) -> UpstreamPool {
    UpstreamPool::new(&config.upstreams)
}

/// Issues one GET through the full pipeline.
pub async fn send_request(
    path: &str,
    config: &Arc<RuntimeConfig>,
    pool: &UpstreamPool,
    admission: &AdmissionControl,
) -> gatehouse::Result<Response<BoxBody>> {
    send_request_from(path, config, pool, admission, test_addr()).await
}

/// Issues one GET through the full pipeline from a specific client address.
pub async fn send_request_from(
    path: &str,
    config: &Arc<RuntimeConfig>,
    pool: &UpstreamPool,
    admission: &AdmissionControl,
    client_addr: SocketAddr,
) -> gatehouse::Result<Response<BoxBody>> {
    let req = Request::builder()
        .method(hyper::Method::GET)
        .uri(format!("http://gateway.test{path}"))
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();

    gatehouse::handle_request(
        req,
        test_client(),
        Arc::clone(config),
        pool.clone(),
        admission.clone(),
        client_addr,
    )
    .await
}

/// Issues one request with a specific method through the full pipeline.
pub async fn send_method_request(
    method: hyper::Method,
    path: &str,
    config: &Arc<RuntimeConfig>,
    pool: &UpstreamPool,
    admission: &AdmissionControl,
) -> gatehouse::Result<Response<BoxBody>> {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://gateway.test{path}"))
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();

    gatehouse::handle_request(
        req,
        test_client(),
        Arc::clone(config),
        pool.clone(),
        admission.clone(),
        test_addr(),
    )
    .await
}

/// Starts a local HTTP server that responds to every request with the given
/// status, content-type, and body. Returns the server address and a handle
/// to shut it down.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| {
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", content_type)
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a local backend that captures and echoes request headers as the
/// response body. Used to verify that the proxy correctly transforms headers.
pub async fn start_echo_headers_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = Vec::new();
                        for (name, value) in req.headers() {
                            if let Ok(v) = value.to_str() {
                                lines.push(format!("{}: {}", name.as_str(), v));
                            }
                        }
                        lines.sort();
                        let body = lines.join("\n");
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
