//! Listener side: plain TCP in on loopback, WebSocket over TLS out.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};

use crate::httptun::{
    endpoint,
    error::Error,
    relay::Relay,
    telemetry::{self, SessionGuard, SessionInfo},
};

const ROLE: &str = "client";

pub struct ClientOptions {
    /// `ws://` or `wss://` URL of the terminator.
    pub remote_addr: String,
    pub dial_timeout: Duration,
    pub tls: Arc<rustls::ClientConfig>,
    pub sessions: telemetry::SharedSessions,
}

pub async fn serve_with_shutdown(
    listener: TcpListener,
    opts: Arc<ClientOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen_addr = listener.local_addr()?;
    tracing::info!(listen_addr = %listen_addr, remote = %opts.remote_addr, "client: listening");

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
                        tracing::warn!(listen_addr = %listen_addr, err = %err, "client: accept failed");
                        continue;
                    }
                };
                let opts = opts.clone();
                tokio::spawn(async move {
                    handle_conn(conn, peer, opts).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_conn(conn: TcpStream, peer: SocketAddr, opts: Arc<ClientOptions>) {
    let _ = conn.set_nodelay(true);
    let sid = telemetry::new_session_id();
    tracing::info!(sid = %sid, role = ROLE, remote = %peer, "client: new connection");

    let ws = match dial_remote(&opts).await {
        Ok(ws) => ws,
        Err(err) => {
            metrics::counter!("httptun_dial_failures_total", "role" => ROLE).increment(1);
            tracing::warn!(sid = %sid, role = ROLE, remote = %peer, err = %err, "client: fail to connect");
            return;
        }
    };
    tracing::info!(sid = %sid, role = ROLE, remote = %peer, peer = %opts.remote_addr, "client: tunnel constructed");

    let info = SessionInfo {
        id: sid,
        role: ROLE,
        remote: peer.to_string(),
        peer: opts.remote_addr.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    };
    let _guard = SessionGuard::register(opts.sessions.clone(), info.clone());
    Relay::new(info, conn, ws).run().await;
}

async fn dial_remote(
    opts: &ClientOptions,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, Error> {
    let dial = connect_async_tls_with_config(
        opts.remote_addr.as_str(),
        Some(endpoint::websocket_config()),
        true,
        Some(Connector::Rustls(opts.tls.clone())),
    );

    let res = if opts.dial_timeout.is_zero() {
        dial.await
    } else {
        tokio::time::timeout(opts.dial_timeout, dial)
            .await
            .map_err(|_| Error::DialFailed {
                target: opts.remote_addr.clone(),
                reason: format!("timed out after {:?}", opts.dial_timeout),
            })?
    };

    res.map(|(ws, _resp)| ws).map_err(|e| Error::DialFailed {
        target: opts.remote_addr.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httptun::{config::TlsConfig, server, tls};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(10);

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("httptun_client_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    async fn echo_backend() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
        let addr = ln.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn client_options(remote_addr: String) -> Arc<ClientOptions> {
        let tls = tls::client_config(&tls::ClientTrust::InsecureSkipVerify).expect("client tls");
        Arc::new(ClientOptions {
            remote_addr,
            dial_timeout: Duration::from_secs(5),
            tls: Arc::new(tls),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
        })
    }

    /// Starts a terminator on `server_ln` that forwards to `backend`.
    fn start_server(
        name: &str,
        server_ln: TcpListener,
        backend: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> std::path::PathBuf {
        let dir = temp_dir(name);
        let server_tls = tls::provision_server_identity(&TlsConfig {
            cert_file: dir.join("httptun.cert"),
            key_file: dir.join("httptun.key"),
            generate: true,
            insecure_skip_verify: true,
            ca_file: None,
        })
        .expect("server tls");
        let server_opts = Arc::new(server::ServerOptions {
            backend_addr: backend.to_string(),
            path: "/".into(),
            dial_timeout: Duration::from_secs(5),
            tls: Arc::new(server_tls),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
        });
        tokio::spawn(server::serve_with_shutdown(server_ln, server_opts, shutdown));
        dir
    }

    async fn assert_echo(client_addr: SocketAddr, payload: &[u8]) {
        let mut conn = TcpStream::connect(client_addr).await.expect("connect");
        conn.write_all(payload).await.expect("write");

        let mut got = vec![0u8; payload.len()];
        tokio::time::timeout(WAIT, conn.read_exact(&mut got))
            .await
            .expect("echo in time")
            .expect("read");
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn bytes_round_trip_through_both_acceptors() {
        let backend = echo_backend().await;
        let (_tx, shutdown) = watch::channel(false);

        let server_ln = TcpListener::bind("127.0.0.1:0").await.expect("bind server");
        let server_addr = server_ln.local_addr().expect("addr");
        let dir = start_server("e2e", server_ln, backend, shutdown.clone());

        let client_ln = TcpListener::bind("127.0.0.1:0").await.expect("bind client");
        let client_addr = client_ln.local_addr().expect("addr");
        let opts = client_options(format!("wss://127.0.0.1:{}/", server_addr.port()));
        let sessions = opts.sessions.clone();
        tokio::spawn(serve_with_shutdown(client_ln, opts, shutdown.clone()));

        let mut conn = TcpStream::connect(client_addr).await.expect("connect");
        conn.write_all(b"remote desktop bytes").await.expect("write");

        let mut got = vec![0u8; 20];
        tokio::time::timeout(WAIT, conn.read_exact(&mut got))
            .await
            .expect("echo in time")
            .expect("read");
        assert_eq!(&got, b"remote desktop bytes");
        assert_eq!(sessions.len(), 1);

        drop(conn);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn remote_dial_failure_does_not_affect_later_sessions() {
        let backend = echo_backend().await;
        let (_tx, shutdown) = watch::channel(false);

        let reserved = TcpListener::bind("127.0.0.1:0").await.expect("reserve port");
        let remote = reserved.local_addr().expect("addr");
        drop(reserved);

        let client_ln = TcpListener::bind("127.0.0.1:0").await.expect("bind client");
        let client_addr = client_ln.local_addr().expect("addr");
        let opts = client_options(format!("wss://127.0.0.1:{}/", remote.port()));
        let sessions = opts.sessions.clone();
        tokio::spawn(serve_with_shutdown(client_ln, opts, shutdown.clone()));

        // Nothing listens on the remote yet: the session is dropped.
        let mut first = TcpStream::connect(client_addr).await.expect("connect");
        let mut buf = [0u8; 8];
        let res = tokio::time::timeout(WAIT, first.read(&mut buf))
            .await
            .expect("closed in time");
        assert!(matches!(res, Ok(0) | Err(_)), "got {res:?}");
        assert_eq!(sessions.len(), 0);

        let server_ln = TcpListener::bind(remote).await.expect("rebind remote");
        let dir = start_server("isolation", server_ln, backend, shutdown.clone());

        assert_echo(client_addr, b"after the failure").await;

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dial_failure_drops_connection_and_keeps_accepting() {
        let (_tx, shutdown) = watch::channel(false);
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let opts = client_options("wss://127.0.0.1:1/".into());
        let sessions = opts.sessions.clone();
        tokio::spawn(serve_with_shutdown(ln, opts, shutdown));

        for _ in 0..2 {
            let mut conn = TcpStream::connect(addr).await.expect("connect");
            let mut buf = [0u8; 8];
            let res = tokio::time::timeout(WAIT, conn.read(&mut buf))
                .await
                .expect("closed in time");
            assert!(matches!(res, Ok(0) | Err(_)), "got {res:?}");
        }
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let (tx, shutdown) = watch::channel(false);
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let task = tokio::spawn(serve_with_shutdown(
            ln,
            client_options("wss://127.0.0.1:1/".into()),
            shutdown,
        ));

        tx.send(true).expect("signal");
        let res = tokio::time::timeout(WAIT, task)
            .await
            .expect("stopped in time")
            .expect("join");
        assert!(res.is_ok());
    }
}
