//! Hive - 实验 Agent
//!
//! 入口：初始化日志、加载配置与模板、为每个 Agent 连接实验服务器并并发运行，
//! 直到 Ctrl+C / SIGTERM 或所有连接关闭。
//! 用法：`hive [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{run_with_graceful_shutdown, GameRunner, ShutdownManager, ShutdownReason};
use hive::prompts::TemplateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    config.validate().context("Invalid config")?;

    let templates = match &config.prompts.dir {
        Some(dir) => TemplateStore::load_dir(dir),
        None => TemplateStore::from_default(),
    }
    .context("Failed to load prompt templates")?;
    tracing::info!(templates = templates.keys().len(), "Prompt templates loaded");

    let shutdown = ShutdownManager::new();
    let runner = Arc::new(
        GameRunner::from_config(&config, Arc::new(templates), &shutdown.token())
            .context("Failed to configure agents")?,
    );

    let game = Arc::clone(&runner);
    let connection_shutdown = shutdown.clone();
    run_with_graceful_shutdown(
        &shutdown,
        async move {
            match game.run().await {
                Ok(()) => connection_shutdown.shutdown(ShutdownReason::ConnectionClosed),
                Err(e) => connection_shutdown.shutdown(ShutdownReason::FatalError(e.to_string())),
            }
        },
        || async {
            runner.stop().await;
        },
    )
    .await;

    if let Some(ShutdownReason::FatalError(e)) = shutdown.reason() {
        anyhow::bail!("Agent stopped with error: {e}");
    }
    Ok(())
}
