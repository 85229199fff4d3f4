mod ai;
mod app;
mod config;
mod db;
mod domain;
mod infrastructure;
mod tasks;
mod telegram;

use anyhow::Result;
use infrastructure::{directories, logging, trigger};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let paths = directories::ensure_directories(&config.directories)?;
    logging::init_tracing(&config, &paths)?;
    tracing::info!(
        gateway = %config.gateway.base_url,
        item_delay = ?config.pipeline.item_delay,
        poll_interval = ?config.pipeline.poll_interval,
        max_poll_attempts = config.pipeline.max_poll_attempts,
        "분석 파이프라인 설정 로드 완료"
    );

    let (shutdown, _) = trigger::Trigger::new();
    trigger::install_signal_handlers(shutdown.clone());

    let app = app::ShareQueueApp::initialize(config, paths, shutdown.clone()).await?;
    app.run().await
}
