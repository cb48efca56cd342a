mod httptun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "httptun",
    version,
    about = "httptun - tunnel TCP sessions through WebSocket over TLS"
)]
struct Cli {
    /// Path to the config file (.yaml/.yml/.toml). If omitted, uses HTTPTUN_CONFIG; then auto-detects config.yaml > httptun.yaml > httptun.yml > httptun.toml in the CWD; then falls back to the OS default path (Linux: /etc/httptun/config.yaml; others: user config dir).
    #[arg(long, env = "HTTPTUN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    httptun::run(cli.config).await
}
