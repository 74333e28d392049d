mod aegis;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "aegis",
    version,
    about = "Aegis - rate-limiting Minecraft protection proxy"
)]
struct Cli {
    /// Path to Aegis config file (.toml/.yaml/.yml). If omitted, uses AEGIS_CONFIG; then auto-detects aegis.toml > aegis.yaml > aegis.yml from CWD; then falls back to the OS default path (Linux: /etc/aegis/aegis.toml; others: user config dir).
    #[arg(long, env = "AEGIS_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    aegis::run(cli.config).await
}
