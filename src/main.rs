//! 命令行入口
//!
//! 子命令：
//! - `update`（默认）: 恢复检查点并跑完整个清单
//! - `retry`: 只重试当前失败的颜色，各尝试一次
//! - `stats`: 读取检查点打印进度，不启动浏览器

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use update_color_hex::infrastructure::ResourceRegistry;
use update_color_hex::orchestrator::{Pipeline, ShutdownCoordinator};
use update_color_hex::services::CheckpointStore;
use update_color_hex::utils::logging;
use update_color_hex::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init("info");

    // 加载配置
    let config = Config::from_env();

    let command = env::args().nth(1).unwrap_or_else(|| "update".to_string());
    match command.as_str() {
        "update" => run_pipeline(config, Mode::Update).await,
        "retry" => run_pipeline(config, Mode::Retry).await,
        "stats" => print_stats(config).await,
        other => {
            eprintln!("未知子命令: {}", other);
            eprintln!("用法: update_color_hex [update|retry|stats]");
            std::process::exit(2);
        }
    }
}

enum Mode {
    Update,
    Retry,
}

async fn run_pipeline(config: Config, mode: Mode) -> Result<()> {
    logging::log_startup(&config.target_url, config.concurrency);

    let registry = Arc::new(ResourceRegistry::new());
    let store = Arc::new(CheckpointStore::new(&config));

    // 先把内存态建出来，停机协调器与流水线共享同一份
    let checkpoint = store.load().await;
    let state = Arc::new(tokio::sync::Mutex::new(
        update_color_hex::RunState::from_checkpoint(checkpoint),
    ));
    let coordinator = ShutdownCoordinator::new(registry.clone(), store.clone(), state.clone());
    coordinator.spawn_signal_listeners();

    let pipeline = Arc::new(
        Pipeline::with_state(config, registry, store, state, coordinator.shutdown_flag()).await?,
    );

    // 停机时把残留会话直接杀掉（登记表清理之后的最后手段）
    {
        let pipeline = pipeline.clone();
        coordinator
            .register_callback(Box::new(move || {
                let pipeline = pipeline.clone();
                Box::pin(async move { pipeline.force_shutdown().await })
            }))
            .await;
    }

    let outcome = match mode {
        Mode::Update => pipeline.run_update().await,
        Mode::Retry => pipeline.run_retry().await,
    };

    match outcome {
        Ok(()) => {
            pipeline.finish().await;
            Ok(())
        }
        Err(e) => {
            // 致命错误路径：抢救进度后以非零退出码结束
            coordinator.handle_fatal(&e.to_string()).await;
            Err(e)
        }
    }
}

async fn print_stats(config: Config) -> Result<()> {
    let store = CheckpointStore::new(&config);
    let checkpoint = store.load().await;
    let stats = &checkpoint.stats;

    info!("{}", "=".repeat(60));
    info!("📊 检查点进度");
    info!("{}", "=".repeat(60));
    info!("游标: {}", checkpoint.current_index);
    info!("结果集: {} 条", checkpoint.updated_colors.len());
    info!("最后保存: {}", checkpoint.last_updated);
    info!("已处理总数: {}", checkpoint.total_processed);
    info!("✅ 已更新: {}/{}", stats.updated, stats.total);
    info!("⏭️ 跳过: {}", stats.skipped);
    info!("❌ 失败: {}", stats.failed);
    if !stats.failed_identifiers.is_empty() {
        info!("📌 仍然失败: {}", stats.failed_identifiers.join(", "));
    }
    if let Some(backup) = &checkpoint.backup_info {
        info!("🗄️ 最近备份: {} v{} ({})", backup.kind, backup.version, backup.timestamp);
    }
    info!("{}", "=".repeat(60));
    Ok(())
}
