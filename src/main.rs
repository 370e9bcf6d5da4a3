use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use gatehouse::config::StoreKind;
use gatehouse::server::{self, ServerState};
use gatehouse::store::{CounterStore, LocalStore, SharedStore};
use gatehouse::{AdmissionControl, Config, RuntimeConfig, UpstreamPool, build_client};

const DEFAULT_CONFIG_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());

    let config = Config::load_from_file(&config_path)
        .and_then(Config::into_runtime)
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });
    let config = Arc::new(config);

    let store = build_store(&config).await;
    if let CounterStore::Local(local) = &store {
        server::spawn_store_sweep(
            local.clone(),
            Duration::from_secs(config.store.sweep_interval_secs),
        );
    }

    let admission = AdmissionControl::new(store, Arc::new(config.admission.clone()));
    let pool = UpstreamPool::new(&config.upstreams);
    let client = build_client(&config);

    let concurrency_limit = config.max_concurrent_requests;
    let state = ServerState {
        config: Arc::clone(&config),
        pool,
        admission,
        semaphore: Arc::new(Semaphore::new(concurrency_limit)),
        concurrency_limit,
    };

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        eprintln!("fatal: failed to bind {}: {e}", config.listen);
        std::process::exit(1);
    });

    info!(addr = %config.listen, upstreams = config.upstreams.len(), "gatehouse listening");

    server::serve(listener, client, state, server::shutdown_signal()).await;
}

/// Selects the counter store backend from configuration and availability:
/// a configured redis that cannot be reached at startup degrades to the
/// local store with a warning rather than refusing to serve.
async fn build_store(config: &RuntimeConfig) -> CounterStore {
    match config.store.kind {
        StoreKind::Local => CounterStore::Local(LocalStore::new()),
        StoreKind::Redis => {
            // Validation guarantees the URL is present for the redis kind.
            let url = config.store.url.as_deref().unwrap_or_default();
            let op_timeout = Duration::from_millis(config.store.operation_timeout_ms);

            match SharedStore::connect(url, op_timeout).await {
                Ok(shared) => {
                    info!(url, "using shared counter store");
                    CounterStore::Shared(shared)
                }
                Err(e) => {
                    warn!(%e, "shared store unavailable, falling back to local store");
                    CounterStore::Local(LocalStore::new())
                }
            }
        }
    }
}
