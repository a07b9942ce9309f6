/// 日志工具模块
///
/// 提供日志初始化和格式化输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::color::RunStats;

/// 初始化日志
///
/// 优先使用 `RUST_LOG` 环境变量，否则回退到给定级别。
pub fn init(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `target_url`: 目标站点
/// - `concurrency`: 并发数
pub fn log_startup(target_url: &str, concurrency: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 颜色补全流水线");
    info!("🌐 目标站点: {}", target_url);
    info!("📊 并发数: {}", concurrency);
    info!("{}", "=".repeat(60));
}

/// 记录清单加载信息
///
/// # 参数
/// - `total`: 颜色总数
/// - `concurrency`: 并发数
/// - `batch_size`: 每批数量
pub fn log_backlog_loaded(total: usize, concurrency: usize, batch_size: usize) {
    info!("✓ 找到 {} 个待处理的颜色", total);
    if concurrency > 1 {
        info!("📋 将以每批 {} 个的方式并发处理", batch_size);
        info!("💡 每批完成后保存检查点，再开始下一批\n");
    } else {
        info!("📋 将逐条顺序处理\n");
    }
}

/// 记录批次开始信息
///
/// # 参数
/// - `batch_num`: 批次编号
/// - `total_batches`: 批次总数
/// - `batch_len`: 本批颜色数量
pub fn log_batch_start(batch_num: usize, total_batches: usize, batch_len: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 批", batch_num, total_batches);
    info!("🎨 本批颜色: {} 个", batch_len);
    info!("{}", "=".repeat(60));
}

/// 记录批次完成信息
///
/// # 参数
/// - `batch_num`: 批次编号
/// - `batch_len`: 本批颜色数量
pub fn log_batch_complete(batch_num: usize, batch_len: usize) {
    info!("\n{}", "─".repeat(60));
    info!("✓ 第 {} 批完成 ({} 个颜色)", batch_num, batch_len);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `stats`: 运行统计
/// - `report_file`: 报告文件路径
pub fn print_final_stats(stats: &RunStats, report_file: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 已更新: {}/{}", stats.updated, stats.total);
    info!("⏭️ 跳过: {}", stats.skipped);
    info!("❌ 失败: {}", stats.failed);
    info!("📈 成功率: {:.1}%", stats.success_rate());
    if !stats.failed_identifiers.is_empty() {
        info!("📌 仍然失败: {}", stats.failed_identifiers.join(", "));
    }
    info!("{}", "=".repeat(60));
    info!("\n报告已保存至: {}", report_file);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
