use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::httptun::error::Error;

/// Terminator's local service when `backend_addr` is not configured.
pub const DEFAULT_BACKEND_ADDR: &str = "127.0.0.1:3389";

/// Matches the handshake timeout of the reference WebSocket dialer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(45);

pub const DEFAULT_CERT_FILE: &str = "httptun.cert";
pub const DEFAULT_KEY_FILE: &str = "httptun.key";

const CONFIG_CANDIDATES: [&str; 4] = ["config.yaml", "httptun.yaml", "httptun.yml", "httptun.toml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Resolves the config file location.
///
/// clap already folds `HTTPTUN_CONFIG` into the flag value, so the order is
/// flag/env, then the working directory, then the OS default.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
        }
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/httptun/config.yaml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("io", "httptun", "httptun")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("config.yaml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Ok(Config::from_file_config(fc)?)
}

/// Which half of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Terminator: HTTPS + WebSocket in, TCP out.
    Server,
    /// Listener: TCP in, WebSocket over TLS out.
    Client,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Client => "client",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            _ => Err(Error::ConfigInvalid(format!("invalid mode: {s:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub port: u16,
    /// Remote WebSocket URL; empty unless `mode` is client.
    pub remote_addr: String,
    pub backend_addr: String,
    pub path: String,
    pub dial_timeout: Duration,
    pub admin_addr: String,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub generate: bool,
    pub insecure_skip_verify: bool,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: String,

    port: i64,

    #[serde(default, rename = "remote-addr", alias = "remote_addr")]
    remote_addr: String,

    backend_addr: Option<String>,

    path: Option<String>,

    dial_timeout_ms: Option<i64>,

    #[serde(default)]
    admin_addr: String,

    tls: Option<FileTls>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    cert_file: Option<String>,
    key_file: Option<String>,
    generate: Option<bool>,
    insecure_skip_verify: Option<bool>,
    ca_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Result<Config, Error> {
        let mode: Mode = fc.mode.parse()?;

        if !(1..=i64::from(u16::MAX)).contains(&fc.port) {
            return Err(Error::ConfigInvalid(format!("invalid port: {}", fc.port)));
        }
        let port = fc.port as u16;

        let remote_addr = fc.remote_addr.trim().to_string();
        if mode == Mode::Client {
            validate_remote_addr(&remote_addr)?;
        }

        let backend_addr = non_empty(fc.backend_addr).unwrap_or_else(|| DEFAULT_BACKEND_ADDR.into());

        let path = non_empty(fc.path).unwrap_or_else(|| "/".into());
        if !path.starts_with('/') {
            return Err(Error::ConfigInvalid(format!(
                "invalid path: {path:?} (must start with '/')"
            )));
        }

        let dial_timeout = match fc.dial_timeout_ms {
            Some(ms) => Duration::from_millis(ms.max(0) as u64),
            None => DEFAULT_DIAL_TIMEOUT,
        };

        let tls = match fc.tls {
            Some(t) => TlsConfig {
                cert_file: PathBuf::from(
                    non_empty(t.cert_file).unwrap_or_else(|| DEFAULT_CERT_FILE.into()),
                ),
                key_file: PathBuf::from(
                    non_empty(t.key_file).unwrap_or_else(|| DEFAULT_KEY_FILE.into()),
                ),
                generate: t.generate.unwrap_or(true),
                insecure_skip_verify: t.insecure_skip_verify.unwrap_or(true),
                ca_file: non_empty(t.ca_file).map(PathBuf::from),
            },
            None => TlsConfig {
                cert_file: PathBuf::from(DEFAULT_CERT_FILE),
                key_file: PathBuf::from(DEFAULT_KEY_FILE),
                generate: true,
                insecure_skip_verify: true,
                ca_file: None,
            },
        };

        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(level) = non_empty(l.level) {
                logging.level = level;
            }
            if let Some(format) = non_empty(l.format) {
                logging.format = format;
            }
            if let Some(output) = non_empty(l.output) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        Ok(Config {
            mode,
            port,
            remote_addr,
            backend_addr,
            path,
            dial_timeout,
            admin_addr: fc.admin_addr.trim().to_string(),
            tls,
            logging,
        })
    }
}

fn validate_remote_addr(addr: &str) -> Result<(), Error> {
    if addr.is_empty() {
        return Err(Error::ConfigInvalid(
            "remote-addr is required in client mode".into(),
        ));
    }
    let url = url::Url::parse(addr)
        .map_err(|e| Error::ConfigInvalid(format!("invalid remote-addr {addr:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::ConfigInvalid(format!(
                "invalid remote-addr {addr:?}: unsupported scheme {other:?} (expected ws or wss)"
            )));
        }
    }
    if url.host_str().is_none() {
        return Err(Error::ConfigInvalid(format!(
            "invalid remote-addr {addr:?}: missing host"
        )));
    }
    Ok(())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
