//! MCP proxy: bridges upstream MCP event streams to browsers and forwards
//! JSON-RPC calls to the upstream bound to a session.

use std::net::SocketAddr;
use std::sync::Arc;

use app::{build_router, ProxyState};
use durable::{DurableStore, UpstashStore};

pub mod app;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod durable;
pub mod forwarder;
pub mod resolver;
pub mod sessions;

pub use config::ServerConfig;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub fn build_state(config: &ServerConfig) -> Result<ProxyState, BoxError> {
    let client = reqwest::Client::builder().build()?;
    let mut state = ProxyState::new(config.catalog.clone())
        .with_client(client.clone())
        .with_rpc_timeout(config.rpc_timeout)
        .with_max_body_bytes(config.max_body_bytes);

    match config.upstash.clone() {
        Some(upstash) => {
            tracing::info!(url = %upstash.url, ttl = ?config.session_ttl, "durable session store enabled");
            let store: Arc<dyn DurableStore> =
                Arc::new(UpstashStore::new(client, upstash, config.session_ttl));
            state = state.with_durable_store(store);
        }
        None => {
            tracing::info!("durable session store not configured, harvested sessions stay local");
        }
    }
    Ok(state)
}

pub async fn run_server(config: ServerConfig) -> Result<(), BoxError> {
    let state = Arc::new(build_state(&config)?);
    run_server_with_state(config.host, config.port, state).await
}

pub async fn run_server_with_state(
    host: String,
    port: u16,
    state: Arc<ProxyState>,
) -> Result<(), BoxError> {
    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, route = app::PROXY_ROUTE, "jetvision-mcp-proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

async fn shutdown_signal(state: Arc<ProxyState>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(
        open_sessions = state.sessions().len(),
        "shutting down"
    );
}
