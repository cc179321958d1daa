pub mod app;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod relay;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
