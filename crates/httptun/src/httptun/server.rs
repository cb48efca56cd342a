//! Terminator side: HTTPS + WebSocket upgrade in, plain TCP out.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::httptun::{
    endpoint,
    error::Error,
    relay::Relay,
    telemetry::{self, SessionGuard, SessionInfo},
};

const ROLE: &str = "server";

pub struct ServerOptions {
    /// Local service every session is forwarded to.
    pub backend_addr: String,
    /// Upgrade route.
    pub path: String,
    pub dial_timeout: Duration,
    pub tls: Arc<rustls::ServerConfig>,
    pub sessions: telemetry::SharedSessions,
}

/// Whether a request path is served by the configured route.
///
/// `/` serves every path. A route ending in `/` serves its subtree; any other
/// route only itself.
pub fn route_matches(route: &str, path: &str) -> bool {
    if route == "/" || route == path {
        return true;
    }
    route.ends_with('/') && path.starts_with(route)
}

pub async fn serve_with_shutdown(
    listener: TcpListener,
    opts: Arc<ServerOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen_addr = listener.local_addr()?;
    let acceptor = TlsAcceptor::from(opts.tls.clone());
    tracing::info!(listen_addr = %listen_addr, path = %opts.path, backend = %opts.backend_addr, "server: listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = listener.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        let err = Error::AcceptFailed(e);
                        tracing::warn!(listen_addr = %listen_addr, err = %err, "server: accept failed");
                        continue;
                    }
                };
                let opts = opts.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handle_conn(conn, peer, acceptor, opts).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_conn(
    conn: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    opts: Arc<ServerOptions>,
) {
    let _ = conn.set_nodelay(true);

    let tls = match acceptor.accept(conn).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(remote = %peer, err = %e, "server: tls handshake failed");
            return;
        }
    };

    let route = opts.path.clone();
    let callback = move |req: &Request, resp: Response| {
        if route_matches(&route, req.uri().path()) {
            Ok(resp)
        } else {
            Err(not_found())
        }
    };
    let mut ws =
        match accept_hdr_async_with_config(tls, callback, Some(endpoint::websocket_config())).await
        {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(remote = %peer, err = %e, "server: upgrade failed");
                return;
            }
        };

    let sid = telemetry::new_session_id();
    tracing::info!(sid = %sid, role = ROLE, remote = %peer, "server: new connection");

    let backend = match dial_backend(&opts).await {
        Ok(s) => s,
        Err(err) => {
            metrics::counter!("httptun_dial_failures_total", "role" => ROLE).increment(1);
            tracing::warn!(sid = %sid, role = ROLE, remote = %peer, err = %err, "server: fail to connect");
            let _ = tokio::time::timeout(
                endpoint::CLOSE_TIMEOUT,
                ws.close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "".into(),
                })),
            )
            .await;
            return;
        }
    };
    tracing::info!(sid = %sid, role = ROLE, remote = %peer, peer = %opts.backend_addr, "server: tunnel constructed");

    let info = SessionInfo {
        id: sid,
        role: ROLE,
        remote: peer.to_string(),
        peer: opts.backend_addr.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    };
    let _guard = SessionGuard::register(opts.sessions.clone(), info.clone());
    Relay::new(info, backend, ws).run().await;
}

async fn dial_backend(opts: &ServerOptions) -> Result<TcpStream, Error> {
    let dial = TcpStream::connect(opts.backend_addr.as_str());
    let res = if opts.dial_timeout.is_zero() {
        dial.await
    } else {
        tokio::time::timeout(opts.dial_timeout, dial)
            .await
            .map_err(|_| Error::DialFailed {
                target: opts.backend_addr.clone(),
                reason: format!("timed out after {:?}", opts.dial_timeout),
            })?
    };

    let conn = res.map_err(|e| Error::DialFailed {
        target: opts.backend_addr.clone(),
        reason: e.to_string(),
    })?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("404 page not found\n".to_string()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httptun::{config::TlsConfig, tls};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{
        Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
        tungstenite::{self, Message},
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("httptun_server_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    async fn start_server(
        name: &str,
        backend_addr: String,
        path: &str,
    ) -> (SocketAddr, watch::Sender<bool>) {
        let dir = temp_dir(name);
        let server_tls = tls::provision_server_identity(&TlsConfig {
            cert_file: dir.join("httptun.cert"),
            key_file: dir.join("httptun.key"),
            generate: true,
            insecure_skip_verify: true,
            ca_file: None,
        })
        .expect("server tls");

        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let opts = Arc::new(ServerOptions {
            backend_addr,
            path: path.into(),
            dial_timeout: Duration::from_secs(5),
            tls: Arc::new(server_tls),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
        });
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve_with_shutdown(ln, opts, rx));
        (addr, tx)
    }

    async fn dial(
        url: String,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Error> {
        let tls = tls::client_config(&tls::ClientTrust::InsecureSkipVerify).expect("client tls");
        connect_async_tls_with_config(url, None, false, Some(Connector::Rustls(Arc::new(tls))))
            .await
            .map(|(ws, _)| ws)
    }

    async fn next_message(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Message {
        tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("message ok")
    }

    #[test]
    fn root_route_matches_everything() {
        assert!(route_matches("/", "/"));
        assert!(route_matches("/", "/anything/at/all"));
    }

    #[test]
    fn exact_and_subtree_routes() {
        assert!(route_matches("/tunnel", "/tunnel"));
        assert!(!route_matches("/tunnel", "/tunnel/x"));
        assert!(!route_matches("/tunnel", "/other"));

        assert!(route_matches("/ws/", "/ws/"));
        assert!(route_matches("/ws/", "/ws/a"));
        assert!(!route_matches("/ws/", "/ws"));
    }

    #[tokio::test]
    async fn other_routes_are_rejected_with_404() {
        let (addr, _tx) = start_server("route", "127.0.0.1:9".into(), "/tunnel").await;

        match dial(format!("wss://127.0.0.1:{}/elsewhere", addr.port())).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
            Err(other) => panic!("expected http 404, got {other:?}"),
            Ok(_) => panic!("upgrade on an unrouted path succeeded"),
        }
    }

    #[tokio::test]
    async fn backend_dial_failure_does_not_affect_later_sessions() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.expect("reserve port");
        let backend_addr = reserved.local_addr().expect("addr");
        drop(reserved);

        let (addr, _tx) = start_server("isolation", backend_addr.to_string(), "/").await;
        let url = format!("wss://127.0.0.1:{}/", addr.port());

        let mut first = dial(url.clone()).await.expect("first upgrade");
        match next_message(&mut first).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Error),
            other => panic!("expected close, got {other:?}"),
        }

        let backend = TcpListener::bind(backend_addr).await.expect("rebind backend");
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let mut second = dial(url).await.expect("second upgrade");
        second
            .send(Message::Binary(b"still alive".to_vec()))
            .await
            .expect("send");
        assert_eq!(
            next_message(&mut second).await,
            Message::Binary(b"still alive".to_vec())
        );
    }
}
