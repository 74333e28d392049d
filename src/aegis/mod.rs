pub mod admin;
pub mod app;
pub mod codec;
pub mod config;
pub mod limiter;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod session;
pub mod store;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
