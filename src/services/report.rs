//! Markdown 报告输出
//!
//! 汇总一次运行的总量、成功率、进度百分比与仍然失败的颜色编号。
//! 运行途中写的是"(进行中)"变体。

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::fs;
use tracing::debug;

use crate::models::color::RunStats;

/// 报告输出器
pub struct ReportWriter {
    path: PathBuf,
}

impl ReportWriter {
    /// 创建新的报告输出器
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 写出 Markdown 报告
    pub async fn write(&self, stats: &RunStats, in_progress: bool) -> Result<()> {
        let content = render_report(stats, in_progress);
        fs::write(&self.path, content)
            .await
            .with_context(|| format!("无法写入报告: {}", self.path.display()))?;
        debug!("📄 报告已写入: {}", self.path.display());
        Ok(())
    }
}

/// 渲染报告正文
fn render_report(stats: &RunStats, in_progress: bool) -> String {
    let title_suffix = if in_progress { "（进行中）" } else { "" };
    let processed = stats.updated + stats.failed + stats.skipped;
    let progress = if stats.total == 0 {
        0.0
    } else {
        processed as f64 / stats.total as f64 * 100.0
    };

    let mut report = String::new();
    report.push_str(&format!("# 颜色补全报告{}\n\n", title_suffix));
    report.push_str(&format!(
        "生成时间: {}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    report.push_str("## 总览\n\n");
    report.push_str(&format!("- 总数: {}\n", stats.total));
    report.push_str(&format!("- 已更新: {}\n", stats.updated));
    report.push_str(&format!("- 失败: {}\n", stats.failed));
    report.push_str(&format!("- 跳过: {}\n", stats.skipped));
    report.push_str(&format!("- 成功率: {:.1}%\n", stats.success_rate()));
    report.push_str(&format!("- 总进度: {:.1}%\n", progress));

    report.push_str("\n## 仍然失败的颜色\n\n");
    if stats.failed_identifiers.is_empty() {
        report.push_str("无 🎉\n");
    } else {
        for code in &stats.failed_identifiers {
            report.push_str(&format!("- {}\n", code));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_totals_and_failures() {
        let stats = RunStats {
            total: 4,
            updated: 2,
            failed: 1,
            skipped: 1,
            failed_identifiers: vec!["A01".to_string()],
            successful_identifiers: vec!["B02".to_string(), "C03".to_string()],
        };
        let report = render_report(&stats, false);
        assert!(report.contains("# 颜色补全报告\n"));
        assert!(report.contains("- 总数: 4"));
        assert!(report.contains("- 成功率: 66.7%"));
        assert!(report.contains("- 总进度: 100.0%"));
        assert!(report.contains("- A01"));
    }

    #[test]
    fn test_in_progress_variant_is_marked() {
        let report = render_report(&RunStats::default(), true);
        assert!(report.contains("（进行中）"));
        assert!(report.contains("无 🎉"));
    }

    #[tokio::test]
    async fn test_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let writer = ReportWriter::new(&path);
        writer.write(&RunStats::default(), false).await.unwrap();
        assert!(path.exists());
    }
}
