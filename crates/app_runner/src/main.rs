mod bootstrap;
mod config_loader;
mod control_api;
mod optimize;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::async_main().await
}
