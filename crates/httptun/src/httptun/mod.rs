pub mod admin;
pub mod app;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod net;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod tls;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
