use std::{sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::aegis::{
    codec::{DecodeError, FrameDecoder},
    limiter::{Limiter, Reject},
    net,
    session::{PacketEvent, Session},
    store::SharedStore,
    telemetry,
};

/// Why a relay direction stopped. `PeerClosed` is the quiet, expected end of
/// a session; everything else is worth a log line.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("peer closed")]
    PeerClosed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("admission rejected: {0}")]
    Rejected(Reject),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

struct ConnMetricsGuard;

impl ConnMetricsGuard {
    fn new() -> Self {
        metrics::counter!("aegis_connections_total").increment(1);
        metrics::gauge!("aegis_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ConnMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!("aegis_active_connections").decrement(1.0);
    }
}

/// Per-connection settings that config reload may change between
/// connections.
#[derive(Debug, Clone)]
pub struct RelayRuntimeConfig {
    pub max_frame_bytes: usize,
    pub upstream_dial_timeout: Duration,
}

pub struct ProxyOptions {
    /// Backend target; reselected by the admin surface between connections,
    /// never mid-connection.
    pub backend: ArcSwap<String>,
    pub limiter: Arc<Limiter>,
    pub sessions: telemetry::SharedSessions,
    pub store: SharedStore,
    pub runtime: tokio::sync::RwLock<RelayRuntimeConfig>,
}

pub async fn serve_tcp_with_shutdown(
    listen_addr: &str,
    opts: Arc<ProxyOptions>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "proxy: listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let o = opts.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "proxy: accepted");
                    }
                    handle_client(conn, o).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_client(mut conn: TcpStream, opts: Arc<ProxyOptions>) {
    let _metrics = ConnMetricsGuard::new();
    let sid = telemetry::new_session_id();

    let Ok(peer) = conn.peer_addr() else {
        let _ = conn.shutdown().await;
        return;
    };
    let client_ip = peer.ip().to_string();

    if let Err(reject) = opts.limiter.check_accept(&client_ip) {
        metrics::counter!("aegis_rejected_total", "reason" => reject.as_label()).increment(1);
        tracing::info!(sid = %sid, client = %peer, reason = %reject, "proxy: connection rejected");
        let _ = conn.shutdown().await;
        return;
    }

    if let Err(err) = opts.store.record_connection(&client_ip).await {
        tracing::warn!(sid = %sid, err = %err, "store: record_connection failed");
    }

    let rt = { opts.runtime.read().await.clone() };
    let backend = opts.backend.load_full();

    let up = match dial_backend(&backend, rt.upstream_dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            metrics::counter!("aegis_rejected_total", "reason" => "backend_unavailable")
                .increment(1);
            tracing::warn!(sid = %sid, client = %peer, backend = %backend, err = %err, "proxy: backend dial failed");
            let _ = conn.shutdown().await;
            return;
        }
    };

    let _active = opts.limiter.track(&client_ip);
    opts.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: peer.to_string(),
        username: String::new(),
        backend: backend.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    let res = relay(conn, up, &sid, client_ip, &opts, rt.max_frame_bytes).await;

    opts.sessions.remove(&sid);

    match res {
        Ok(()) | Err(RelayError::PeerClosed) => {
            tracing::debug!(sid = %sid, "proxy: session ended");
        }
        Err(RelayError::Rejected(reject)) => {
            metrics::counter!("aegis_rejected_total", "reason" => reject.as_label()).increment(1);
            tracing::info!(sid = %sid, client = %peer, reason = %reject, "proxy: session rejected");
        }
        Err(RelayError::Decode(err)) => {
            tracing::warn!(sid = %sid, client = %peer, err = %err, "proxy: protocol error");
        }
        Err(RelayError::Io(err)) => {
            tracing::debug!(sid = %sid, err = %err, "proxy: session ended with error");
        }
    }
}

async fn dial_backend(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let addr = addr.trim();
    if addr.is_empty() {
        anyhow::bail!("empty backend address");
    }
    if timeout > Duration::from_millis(0) {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
            .with_context(|| format!("dial {addr}"))
    } else {
        TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial {addr}"))
    }
}

/// Run both relay directions until the first one stops, then tear down both
/// sockets. The peer direction never lingers: dropping its half aborts any
/// pending read or write.
async fn relay(
    client: TcpStream,
    backend: TcpStream,
    sid: &str,
    client_ip: String,
    opts: &Arc<ProxyOptions>,
    max_frame_bytes: usize,
) -> Result<(), RelayError> {
    let (mut cr, mut cw) = client.into_split();
    let (mut br, mut bw) = backend.into_split();

    let mut session = Session::new(client_ip);

    let res = {
        let c2b = client_to_backend(&mut cr, &mut bw, &mut session, sid, opts, max_frame_bytes);
        let b2c = backend_to_client(&mut br, &mut cw);

        tokio::select! {
            r = c2b => r,
            r = b2c => r,
        }
    };

    // Idempotent, best-effort close of both legs; the unfinished direction
    // observes the closed peer on its next poll.
    let _ = cw.shutdown().await;
    let _ = bw.shutdown().await;

    res
}

/// Inspecting direction: decode frames, consult admission per frame, forward
/// allowed frames byte-for-byte.
async fn client_to_backend(
    r: &mut OwnedReadHalf,
    w: &mut OwnedWriteHalf,
    session: &mut Session,
    sid: &str,
    opts: &Arc<ProxyOptions>,
    max_frame_bytes: usize,
) -> Result<(), RelayError> {
    let mut dec = FrameDecoder::new(max_frame_bytes);
    let mut tmp = vec![0u8; 4096];

    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            return Err(RelayError::PeerClosed);
        }
        dec.extend(&tmp[..n]);

        while let Some(frame) = dec.next_frame()? {
            // A rejected frame is never forwarded; the whole session stops.
            opts.limiter
                .check_frame(session.client_ip())
                .map_err(RelayError::Rejected)?;

            if let Err(err) = opts.store.record_packet(session.client_ip()).await {
                tracing::warn!(sid = %sid, err = %err, "store: record_packet failed");
            }

            match session.inspect(&frame)? {
                Some(PacketEvent::Handshake {
                    protocol_version,
                    server_addr,
                    port,
                    next_state,
                }) => {
                    tracing::debug!(
                        sid = %sid,
                        protocol_version,
                        server_addr = %server_addr,
                        port,
                        next_state,
                        "inspect: handshake"
                    );
                }
                Some(PacketEvent::LoginStart { username }) => {
                    opts.sessions.set_username(sid, &username);
                    tracing::info!(sid = %sid, username = %username, "inspect: login start");
                }
                Some(PacketEvent::Chat { message }) => {
                    tracing::debug!(sid = %sid, message = %message, "inspect: chat");
                }
                None => {}
            }

            w.write_all(frame.raw()).await?;
            metrics::counter!("aegis_frames_total").increment(1);
            metrics::counter!("aegis_bytes_ingress_total").increment(frame.raw().len() as u64);
        }
    }
}

/// Opaque direction: untouched pass-through.
async fn backend_to_client(
    r: &mut OwnedReadHalf,
    w: &mut OwnedWriteHalf,
) -> Result<(), RelayError> {
    let mut tmp = vec![0u8; 4096];
    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            return Err(RelayError::PeerClosed);
        }
        w.write_all(&tmp[..n]).await?;
        metrics::counter!("aegis_bytes_egress_total").increment(n as u64);
    }
}
