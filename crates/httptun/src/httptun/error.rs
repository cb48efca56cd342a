use thiserror::Error;

/// Startup and per-connection failures.
///
/// Data-path failures inside a running session are `relay::RelayError`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("listen on {addr} failed: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    #[error("dial {target} failed: {reason}")]
    DialFailed { target: String, reason: String },

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error must stop the process rather than a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvalid(_)
                | Error::ListenFailed { .. }
                | Error::CertificateGeneration(_)
                | Error::Tls(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
