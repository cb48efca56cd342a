use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::httptun::{
    admin, client,
    config::{self, Mode},
    error::Error,
    logging, net, server, telemetry, tls,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    // Another component may have installed one already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        mode = %cfg.mode,
        port = cfg.port,
        admin_addr = %cfg.admin_addr,
        "httptun: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Fatal startup steps happen before anything is spawned.
    let listener = net::bind_tunnel_listener(cfg.mode, cfg.port)
        .await
        .map_err(fatal)?;

    match cfg.mode {
        Mode::Server => {
            let server_tls = tls::provision_server_identity(&cfg.tls).map_err(fatal)?;
            let opts = Arc::new(server::ServerOptions {
                backend_addr: cfg.backend_addr.clone(),
                path: cfg.path.clone(),
                dial_timeout: cfg.dial_timeout,
                tls: Arc::new(server_tls),
                sessions: sessions.clone(),
            });
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server::serve_with_shutdown(listener, opts, shutdown).await });
        }
        Mode::Client => {
            let trust = tls::ClientTrust::from_config(&cfg.tls);
            if trust == tls::ClientTrust::InsecureSkipVerify {
                tracing::warn!(
                    remote = %cfg.remote_addr,
                    "tls: server certificate verification disabled"
                );
            }
            let client_tls = tls::client_config(&trust).map_err(fatal)?;
            let opts = Arc::new(client::ClientOptions {
                remote_addr: cfg.remote_addr.clone(),
                dial_timeout: cfg.dial_timeout,
                tls: Arc::new(client_tls),
                sessions: sessions.clone(),
            });
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { client::serve_with_shutdown(listener, opts, shutdown).await });
        }
    }

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            mode: cfg.mode,
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn fatal(err: Error) -> anyhow::Error {
    if err.is_fatal() {
        tracing::error!(err = %err, "httptun: startup failed");
    }
    err.into()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
