use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::task::JoinSet;

use crate::aegis::{
    admin, config, limiter, logging, net, proxy,
    store::{self, SharedStore},
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        backend = %cfg.backend,
        admin_addr = %cfg.admin_addr,
        max_connections = cfg.limiter.max_connections,
        conn_window = %humantime::format_duration(cfg.limiter.conn_window),
        max_packets = cfg.limiter.max_packets,
        packet_window = %humantime::format_duration(cfg.limiter.packet_window),
        "aegis: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());
    let lim = Arc::new(limiter::Limiter::new(cfg.limiter.clone()));
    let audit: SharedStore = Arc::new(store::NullStore);

    // Re-apply blocks persisted by a previous run.
    match audit.load_blocked().await {
        Ok(blocked) => {
            for ip in blocked {
                lim.block(&ip);
            }
        }
        Err(err) => {
            tracing::warn!(err = %err, "store: load_blocked failed");
        }
    }

    let opts = Arc::new(proxy::ProxyOptions {
        backend: ArcSwap::from_pointee(cfg.backend.clone()),
        limiter: lim.clone(),
        sessions: sessions.clone(),
        store: audit.clone(),
        runtime: tokio::sync::RwLock::new(proxy::RelayRuntimeConfig {
            max_frame_bytes: cfg.max_frame_bytes,
            upstream_dial_timeout: cfg.upstream_dial_timeout,
        }),
    });

    let (reload_tx, reload_rx) = tokio::sync::watch::channel(telemetry::ReloadSignal::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Config reload loop (polling + admin-triggered).
    {
        let config_path = resolved.path.clone();
        let opts = opts.clone();
        let mut reload_rx = reload_rx.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut enabled = cfg.reload.enabled;
        let mut poll = cfg.reload.poll_interval;
        let mut last = cfg.clone();

        tasks.spawn(async move {
            reload_loop(
                config_path,
                opts,
                &mut reload_rx,
                &mut shutdown,
                &mut enabled,
                &mut poll,
                &mut last,
            )
            .await;
            Ok(())
        });
    }

    // Periodic maintenance: audit purge plus idle rate-record eviction.
    {
        let audit = audit.clone();
        let lim = lim.clone();
        let interval = cfg.store.purge_interval;
        let retain = cfg.store.retain;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            maintenance_loop(audit, lim, interval, retain, shutdown).await;
            Ok(())
        });
    }

    // Admin server.
    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            proxy: opts.clone(),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Proxy listener.
    {
        let listen_addr = cfg.listen_addr.clone();
        let opts = opts.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { proxy::serve_tcp_with_shutdown(&listen_addr, opts, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {
            // Best-effort: tasks are expected to observe shutdown; ignore errors during teardown.
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn maintenance_loop(
    audit: SharedStore,
    lim: Arc<limiter::Limiter>,
    interval: Duration,
    retain: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if interval <= Duration::from_millis(0) {
        return;
    }

    let mut tick = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so startup stays quiet.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                lim.evict_idle();
                if let Err(err) = audit.purge_older_than(retain).await {
                    tracing::warn!(err = %err, "store: purge failed");
                } else {
                    tracing::debug!(retain = %humantime::format_duration(retain), "store: purge ran");
                }
            }
        }
    }
}

async fn reload_loop(
    config_path: PathBuf,
    opts: Arc<proxy::ProxyOptions>,
    reload_rx: &mut tokio::sync::watch::Receiver<telemetry::ReloadSignal>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
    last: &mut config::Config,
) {
    let mut last_sig = file_sig(&config_path).ok();

    loop {
        let sleep_dur = if *enabled {
            (*poll_interval).max(Duration::from_millis(200))
        } else {
            Duration::from_secs(3600)
        };

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = reload_rx.changed() => {
                apply_reload(&config_path, &opts, enabled, poll_interval, last).await;
                last_sig = file_sig(&config_path).ok();
            }
            _ = tokio::time::sleep(sleep_dur) => {
                if !*enabled {
                    continue;
                }
                let sig = match file_sig(&config_path) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if last_sig.is_some_and(|prev| prev == sig) {
                    continue;
                }
                apply_reload(&config_path, &opts, enabled, poll_interval, last).await;
                last_sig = Some(sig);
            }
        }
    }
}

async fn apply_reload(
    config_path: &PathBuf,
    opts: &Arc<proxy::ProxyOptions>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
    last: &mut config::Config,
) {
    let cfg = match config::load_config(config_path) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(path=%config_path.display(), err=%err, "reload: config load failed");
            return;
        }
    };

    // Listener and admin topology changes require restart.
    if cfg.listen_addr.trim() != last.listen_addr.trim() {
        tracing::warn!("reload: listen_addr changed; restart required to apply");
    }
    if cfg.admin_addr.trim() != last.admin_addr.trim() {
        tracing::warn!("reload: admin_addr changed; restart required to apply");
    }

    opts.limiter.update_settings(cfg.limiter.clone());

    // Only override the backend when the config value itself changed, so a
    // reload does not stomp an admin-selected target.
    if cfg.backend != last.backend {
        opts.backend.store(Arc::new(cfg.backend.clone()));
    }

    *opts.runtime.write().await = proxy::RelayRuntimeConfig {
        max_frame_bytes: cfg.max_frame_bytes,
        upstream_dial_timeout: cfg.upstream_dial_timeout,
    };

    *enabled = cfg.reload.enabled;
    *poll_interval = cfg.reload.poll_interval;
    *last = cfg;

    tracing::info!("reload: applied");
}

fn file_sig(path: &PathBuf) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, len))
}
