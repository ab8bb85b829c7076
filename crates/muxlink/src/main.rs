mod muxlink;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "muxlink",
    version,
    about = "muxlink - route multiplexed tunnel streams to local TCP and Unix sockets"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses MUXLINK_CONFIG; then auto-detects muxlink.toml > muxlink.yaml > muxlink.yml from CWD; then falls back to the OS default path (Linux: /etc/muxlink/muxlink.toml; others: user config dir).
    #[arg(long, env = "MUXLINK_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    muxlink::run(cli.config).await
}
