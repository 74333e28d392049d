use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::aegis::{proxy, telemetry};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub proxy: Arc<proxy::ProxyOptions>,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<telemetry::ReloadSignal>,
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let shared = Arc::new(state);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/blocked", get(blocked))
        .route("/block", post(block))
        .route("/unblock", post(unblock))
        .route("/accepting", post(accepting))
        .route("/backend", post(backend))
        .route("/reload", post(reload))
        .route("/config", get(config))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

#[derive(Debug, Serialize)]
struct ConnsResponse {
    sessions: Vec<telemetry::SessionInfo>,
    active_by_ip: Vec<ActiveCount>,
}

#[derive(Debug, Serialize)]
struct ActiveCount {
    ip: String,
    count: u64,
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let sessions = st.proxy.sessions.snapshot();
    let active_by_ip = st
        .proxy
        .limiter
        .connection_counts()
        .into_iter()
        .map(|(ip, count)| ActiveCount { ip, count })
        .collect();
    (
        StatusCode::OK,
        Json(ConnsResponse {
            sessions,
            active_by_ip,
        }),
    )
}

#[derive(Debug, Serialize)]
struct BlockedResponse {
    blocked: Vec<String>,
}

async fn blocked(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(BlockedResponse {
            blocked: st.proxy.limiter.list_blocked(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct IpRequest {
    ip: String,
}

#[derive(Debug, Serialize)]
struct IpResponse {
    ip: String,
    changed: bool,
}

async fn block(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<IpRequest>,
) -> impl IntoResponse {
    let ip = req.ip.trim().to_string();
    if ip.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(IpResponse { ip, changed: false }));
    }

    let changed = st.proxy.limiter.block(&ip);
    if changed {
        tracing::info!(ip = %ip, "admin: blocked");
        if let Err(err) = st.proxy.store.record_block(&ip).await {
            tracing::warn!(ip = %ip, err = %err, "store: record_block failed");
        }
    }
    (StatusCode::OK, Json(IpResponse { ip, changed }))
}

async fn unblock(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<IpRequest>,
) -> impl IntoResponse {
    let ip = req.ip.trim().to_string();
    if ip.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(IpResponse { ip, changed: false }));
    }

    let changed = st.proxy.limiter.unblock(&ip);
    if changed {
        tracing::info!(ip = %ip, "admin: unblocked");
        if let Err(err) = st.proxy.store.record_unblock(&ip).await {
            tracing::warn!(ip = %ip, err = %err, "store: record_unblock failed");
        }
    }
    (StatusCode::OK, Json(IpResponse { ip, changed }))
}

#[derive(Debug, Deserialize)]
struct AcceptingRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct AcceptingResponse {
    enabled: bool,
}

async fn accepting(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<AcceptingRequest>,
) -> impl IntoResponse {
    st.proxy.limiter.set_accepting(req.enabled);
    tracing::info!(enabled = req.enabled, "admin: set accepting");
    (
        StatusCode::OK,
        Json(AcceptingResponse {
            enabled: st.proxy.limiter.is_accepting(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct BackendRequest {
    addr: String,
}

#[derive(Debug, Serialize)]
struct BackendResponse {
    addr: String,
}

/// Reselect the backend for subsequent connections. Established relays keep
/// the target they dialed.
async fn backend(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<BackendRequest>,
) -> impl IntoResponse {
    let addr = req.addr.trim().to_string();
    if addr.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(BackendResponse { addr }));
    }

    st.proxy.backend.store(Arc::new(addr.clone()));
    tracing::info!(backend = %addr, "admin: backend selected");
    (StatusCode::OK, Json(BackendResponse { addr }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut next = (*st.reload_tx.borrow()).clone();
    next.next();
    let seq = next.seq;

    // Best-effort: if receivers are gone, still return OK.
    let _ = st.reload_tx.send(next);

    (StatusCode::OK, Json(ReloadResponse { seq }))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}
