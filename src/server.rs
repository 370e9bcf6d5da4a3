//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP listener
//! and the per-request pipeline. This module is intentionally decoupled
//! from `main()` so that the server logic remains testable and reusable
//! without pulling in process-level concerns like signal handling or
//! `std::process::exit`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::admission::AdmissionControl;
use crate::config::RuntimeConfig;
use crate::proxy::{BoxBody, HttpClient, handle_request};
use crate::store::LocalStore;
use crate::upstream::UpstreamPool;
use crate::GatewayError;

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// Validated gateway configuration shared by all handlers.
    pub config: Arc<RuntimeConfig>,
    /// Upstream backends with passive health state.
    pub pool: UpstreamPool,
    /// The admission control engine.
    pub admission: AdmissionControl,
    /// Bounds the number of concurrent in-flight requests.
    pub semaphore: Arc<Semaphore>,
    /// Cached value of the semaphore capacity, used in error messages.
    pub concurrency_limit: usize,
}

/// Accepts connections on `listener` and dispatches them through the
/// gateway pipeline using the given `client` and shared `state`.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve(
    listener: TcpListener,
    client: HttpClient,
    state: ServerState,
    shutdown: impl Future<Output = ()>,
) {
    let ServerState {
        config,
        pool,
        admission,
        semaphore,
        concurrency_limit,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let client = client.clone();
                let config = Arc::clone(&config);
                let pool = pool.clone();
                let admission = admission.clone();
                let semaphore = Arc::clone(&semaphore);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let client = client.clone();
                        let config = Arc::clone(&config);
                        let pool = pool.clone();
                        let admission = admission.clone();
                        let semaphore = Arc::clone(&semaphore);
                        async move {
                            let resp = match semaphore.try_acquire() {
                                Ok(_permit) => {
                                    handle_request(req, client, config, pool, admission, client_addr)
                                        .await
                                        .unwrap_or_else(GatewayError::into_response)
                                }
                                Err(_) => {
                                    warn!(
                                        limit = concurrency_limit,
                                        "concurrency limit reached, rejecting request"
                                    );
                                    GatewayError::ServiceUnavailable {
                                        limit: concurrency_limit,
                                    }
                                    .into_response()
                                }
                            };
                            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Spawns the background task that periodically evicts expired entries
/// from the local counter store.
///
/// Eviction only bounds memory: reads already treat expired entries as
/// absent, so sweep latency never extends a block or a window.
pub fn spawn_store_sweep(store: LocalStore, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let evicted = store.purge_expired();
            if evicted > 0 {
                info!(evicted, remaining = store.len(), "store sweep completed");
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
