use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub role: &'static str,
    /// Where the tunneled connection came from.
    pub remote: String,
    /// The peer leg the session was relayed to.
    pub peer: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.sessions.iter().map(|s| s.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

/// Keeps the session registry and the active-session gauge in sync with the
/// lifetime of one relayed session.
pub struct SessionGuard {
    sessions: SharedSessions,
    id: String,
    role: &'static str,
}

impl SessionGuard {
    pub fn register(sessions: SharedSessions, info: SessionInfo) -> Self {
        let id = info.id.clone();
        let role = info.role;
        metrics::counter!("httptun_sessions_total", "role" => role).increment(1);
        metrics::gauge!("httptun_active_sessions", "role" => role).increment(1.0);
        sessions.add(info);
        Self { sessions, id, role }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        metrics::gauge!("httptun_active_sessions", "role" => self.role).decrement(1.0);
        self.sessions.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, started: u64) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            role: "client",
            remote: "127.0.0.1:50000".into(),
            peer: "wss://example.com/".into(),
            started_at_unix_ms: started,
        }
    }

    #[test]
    fn snapshot_is_ordered_by_start_time() {
        let reg = SessionRegistry::new();
        reg.add(info("s2", 20));
        reg.add(info("s1", 10));

        let ids: Vec<String> = reg.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn guard_removes_session_on_drop() {
        let reg = Arc::new(SessionRegistry::new());
        {
            let _guard = SessionGuard::register(reg.clone(), info("s9", 1));
            assert_eq!(reg.len(), 1);
        }
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with('s'));
    }
}
