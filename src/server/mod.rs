mod mcp;
mod rest;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::ServeArgs;
use crate::events::EventBus;
use crate::gateway::Gateway;
use crate::oauth::OAuthManager;
use crate::request_log::{DEFAULT_LOG_CAPACITY, RequestLog};
use crate::store::Store;

pub use mcp::{DownstreamRegistry, ProxyMcpServer, spawn_list_changed_relay};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn resolve_data_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    dirs::data_local_dir()
        .map(|root| root.join("gatehouse"))
        .ok_or_else(|| anyhow!("unable to resolve a data directory; pass --data-dir or DATA_DIR"))
}

pub async fn serve(args: ServeArgs) -> Result<()> {
    let data_dir = resolve_data_dir(args.data_dir.clone())?;
    let store = Store::open(&data_dir)
        .with_context(|| format!("failed to open store in {}", data_dir.display()))?;

    let addr = SocketAddr::from((args.host, args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local listener address")?;

    // The externally-reachable base URL feeds OAuth redirect URLs, so an
    // explicit override wins over the bound address.
    let base_url = args
        .base_url
        .clone()
        .unwrap_or_else(|| format!("http://{local_addr}"));

    let events = EventBus::new();
    let request_log = RequestLog::new(DEFAULT_LOG_CAPACITY, events.clone());
    let oauth = OAuthManager::new(store.clone(), events.clone(), base_url.clone());
    let gateway = Gateway::new(store.clone(), oauth.clone(), events.clone());
    gateway.initialize().await;

    let downstream = DownstreamRegistry::default();
    let relay_cancel = CancellationToken::new();
    spawn_list_changed_relay(&events, downstream.clone(), relay_cancel.child_token());

    let state = rest::AppState {
        gateway: gateway.clone(),
        oauth,
        events,
        request_log: request_log.clone(),
        started: Instant::now(),
    };

    let mcp_gateway = gateway.clone();
    let mcp_service = StreamableHttpService::new(
        move || {
            Ok(ProxyMcpServer::new(
                mcp_gateway.clone(),
                request_log.clone(),
                downstream.clone(),
            ))
        },
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let app = rest::router(state).nest_service("/mcp", mcp_service);

    info!(addr = %local_addr, base_url = %base_url, data_dir = %data_dir.display(), "gatehouse listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server exited unexpectedly")?;

    relay_cancel.cancel();

    let graceful = async {
        gateway.shutdown().await;
        if let Err(err) = store.close().await {
            warn!(error = %err, "final store flush failed");
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, graceful).await.is_err() {
        warn!("graceful shutdown timed out, exiting");
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = terminate_signal() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
