use std::borrow::Cow;

use tokio::net::TcpListener;

use crate::httptun::{config::Mode, error::Error};

/// Normalize a bind/listen address.
///
/// The admin address accepts the shorthand `":PORT"` for "all interfaces",
/// which Tokio's bind APIs do not, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Tunnel listen address for a role.
///
/// The client only accepts local connections; the server is reachable from
/// everywhere.
pub fn tunnel_listen_addr(mode: Mode, port: u16) -> String {
    match mode {
        Mode::Client => format!("127.0.0.1:{port}"),
        Mode::Server => format!("0.0.0.0:{port}"),
    }
}

/// Binds the tunnel listener for a role. Failure here is fatal at startup.
pub async fn bind_tunnel_listener(mode: Mode, port: u16) -> Result<TcpListener, Error> {
    let addr = tunnel_listen_addr(mode, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| Error::ListenFailed { addr, source })
}
