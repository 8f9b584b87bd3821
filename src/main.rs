use std::sync::Arc;

use tokio::signal;
use tracing::info;

use roomcast::config;
use roomcast::logging;
use roomcast::metrics::register_metrics;
use roomcast::orchestrator::Sfu;
use roomcast::store::{redis_url, MemoryStore, RedisStore, StateStore};
use roomcast::http_api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Validate environment variables before starting the server
    let cfg = config::validate_env().unwrap_or_else(|e| {
        eprintln!("Environment validation failed: {}", e);
        std::process::exit(1);
    });

    // Initialize tracing with validated RUST_LOG
    logging::init(&cfg.rust_log);

    // Initialize Metrics
    register_metrics();

    let store_configured = cfg.store_addr.is_some();
    let store: Arc<dyn StateStore> = match &cfg.store_addr {
        Some(addr) => {
            let url = redis_url(addr, cfg.store_password.as_deref(), cfg.store_db);
            Arc::new(RedisStore::new(&url)?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let host = cfg.host.clone();
    let port = cfg.port;
    let shutdown_timeout = cfg.shutdown_timeout;

    let sfu = Sfu::new(Arc::new(cfg), store, store_configured)?;
    sfu.recover_sessions().await;

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(instance = %sfu.instance_id, %addr, "SFU server listening");

    let routes = http_api::routes(sfu.clone());

    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal (SIGINT/SIGTERM)");
    };

    let (_bound, server) =
        warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown_signal);
    server.await;

    // Shutdown sequence: rooms close first (closing transports), then the
    // client write queues flush within the grace period.
    info!("Shutting down SFU - closing rooms and draining clients");
    sfu.shutdown().await;
    tokio::time::sleep(shutdown_timeout.min(std::time::Duration::from_secs(2))).await;
    info!("SFU shutdown complete");

    Ok(())
}
