//! 检查点存储
//!
//! 检查点是整个流程可恢复性的权威载体。保存流程：
//! 去重 → 全量备份旧文件 → 增量快照 → 结构化序列化写盘 →
//! 回读校验（条目数与关键统计必须一致，不一致即该次保存失败）→
//! 修剪超出保留份数的旧全量备份。备份失败只记日志，绝不阻塞主保存。

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::checkpoint::{dedup_colors, file_timestamp, now_iso8601, BackupInfo, Checkpoint};
use crate::models::color::{ColorEntry, RunStats};
use crate::services::incremental_backup::IncrementalBackupStore;

/// 全量备份文件名前缀
const FULL_BACKUP_PREFIX: &str = "checkpoint_backup_";
/// 紧急备份文件名前缀
const EMERGENCY_PREFIX: &str = "emergency_backup_";

/// 紧急备份：检查点外加信号与原因
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmergencySnapshot<'a> {
    signal: &'a str,
    reason: &'a str,
    saved_at: String,
    #[serde(flatten)]
    checkpoint: &'a Checkpoint,
}

/// 检查点存储
pub struct CheckpointStore {
    checkpoint_path: PathBuf,
    backup_dir: PathBuf,
    retention: usize,
    incremental: IncrementalBackupStore,
}

impl CheckpointStore {
    /// 创建新的检查点存储
    pub fn new(config: &Config) -> Self {
        Self {
            checkpoint_path: PathBuf::from(&config.checkpoint_file),
            backup_dir: PathBuf::from(&config.backup_dir),
            retention: config.backup_retention,
            incremental: IncrementalBackupStore::new(&config.backup_dir, config.backup_retention),
        }
    }

    /// 加载检查点
    ///
    /// 文件缺失、为空或无法解析时一律返回全新的空检查点；
    /// 旧版编码（条目为 JSON 字符串）在反序列化时就地归一化。
    pub async fn load(&self) -> Checkpoint {
        let content = match fs::read_to_string(&self.checkpoint_path).await {
            Ok(content) => content,
            Err(_) => {
                info!("📂 未找到检查点文件，从头开始");
                return Checkpoint::empty();
            }
        };
        if content.trim().is_empty() {
            info!("📂 检查点文件为空，从头开始");
            return Checkpoint::empty();
        }
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "📂 已加载检查点: 游标 {}, 结果 {} 条, 失败 {} 个",
                    checkpoint.current_index,
                    checkpoint.updated_colors.len(),
                    checkpoint.stats.failed_identifiers.len()
                );
                checkpoint
            }
            Err(e) => {
                warn!("⚠️ 检查点无法解析，从头开始: {}", e);
                Checkpoint::empty()
            }
        }
    }

    /// 保存检查点
    ///
    /// 写入后回读并做结构化校验；校验不一致对该次保存是致命错误。
    pub async fn save(
        &self,
        cursor: usize,
        colors: &[ColorEntry],
        stats: &RunStats,
    ) -> AppResult<Checkpoint> {
        let deduped = dedup_colors(colors.to_vec());
        let previous = self.load_silently().await;

        // 备份先行：失败只记日志，绝不阻塞主保存
        self.write_full_backup().await;
        let backup_info = self.write_incremental(&previous, cursor, &deduped, stats).await;

        let checkpoint = Checkpoint {
            current_index: cursor,
            updated_colors: deduped,
            stats: stats.clone(),
            last_updated: now_iso8601(),
            total_processed: stats.updated + stats.failed + stats.skipped,
            backup_info,
        };

        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(AppError::from)?;
        fs::write(&self.checkpoint_path, json).await.map_err(|e| {
            AppError::file_write_failed(self.checkpoint_path.display().to_string(), e)
        })?;

        // 回读校验：写进去的必须就是要求写的
        let written = self.load_silently().await;
        verify_written(&written, &checkpoint)?;

        info!(
            "💾 检查点已保存: 游标 {}, 结果 {} 条, 成功 {}, 失败 {}",
            checkpoint.current_index,
            checkpoint.updated_colors.len(),
            checkpoint.stats.updated,
            checkpoint.stats.failed
        );

        if let Err(e) = self.prune_full_backups().await {
            warn!("⚠️ 修剪旧全量备份失败: {}", e);
        }

        Ok(checkpoint)
    }

    /// 写入紧急备份（信号/致命错误路径专用）
    pub async fn write_emergency(
        &self,
        checkpoint: &Checkpoint,
        signal: &str,
        reason: &str,
    ) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| AppError::file_write_failed(self.backup_dir.display().to_string(), e))?;
        let path = self.backup_dir.join(format!(
            "{}{}_{}.json",
            EMERGENCY_PREFIX,
            signal,
            file_timestamp()
        ));
        let snapshot = EmergencySnapshot {
            signal,
            reason,
            saved_at: now_iso8601(),
            checkpoint,
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(AppError::from)?;
        fs::write(&path, json)
            .await
            .map_err(|e| AppError::file_write_failed(path.display().to_string(), e))?;
        info!("🆘 紧急备份已写入: {}", path.display());
        Ok(path)
    }

    // ========== 内部辅助 ==========

    /// 静默加载（校验与差异计算用，不打进度日志）
    async fn load_silently(&self) -> Checkpoint {
        match fs::read_to_string(&self.checkpoint_path).await {
            Ok(content) if !content.trim().is_empty() => {
                serde_json::from_str(&content).unwrap_or_else(|_| Checkpoint::empty())
            }
            _ => Checkpoint::empty(),
        }
    }

    /// 把当前检查点文件复制一份为带时间戳的全量备份
    async fn write_full_backup(&self) {
        if !self.checkpoint_path.exists() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&self.backup_dir).await {
            warn!("⚠️ 无法创建备份目录: {}", e);
            return;
        }
        let target = self
            .backup_dir
            .join(format!("{}{}.json", FULL_BACKUP_PREFIX, file_timestamp()));
        match fs::copy(&self.checkpoint_path, &target).await {
            Ok(_) => info!("🗄️ 全量备份已写入: {}", file_name(&target)),
            Err(e) => warn!("⚠️ 全量备份失败: {}", e),
        }
    }

    /// 计算并落盘增量快照，返回写入检查点用的备份元信息
    async fn write_incremental(
        &self,
        previous: &Checkpoint,
        cursor: usize,
        deduped: &[ColorEntry],
        stats: &RunStats,
    ) -> Option<BackupInfo> {
        let next = Checkpoint {
            current_index: cursor,
            updated_colors: deduped.to_vec(),
            stats: stats.clone(),
            last_updated: now_iso8601(),
            total_processed: stats.updated + stats.failed + stats.skipped,
            backup_info: None,
        };
        match self.incremental.save_snapshot(previous, &next).await {
            Ok((_, version)) => Some(BackupInfo {
                kind: "incremental".to_string(),
                timestamp: now_iso8601(),
                version,
            }),
            Err(e) => {
                warn!("⚠️ 增量快照失败: {}", e);
                previous.backup_info.clone()
            }
        }
    }

    /// 修剪超出保留份数的旧全量备份
    async fn prune_full_backups(&self) -> anyhow::Result<()> {
        if !self.backup_dir.exists() {
            return Ok(());
        }
        let mut backups = Vec::new();
        let mut entries = fs::read_dir(&self.backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if file_name(&path).starts_with(FULL_BACKUP_PREFIX)
                && path.extension().and_then(|s| s.to_str()) == Some("json")
            {
                backups.push(path);
            }
        }
        if backups.len() <= self.retention {
            return Ok(());
        }
        backups.sort();
        let excess = backups.len() - self.retention;
        for path in backups.into_iter().take(excess) {
            fs::remove_file(&path).await?;
            info!("🗑️ 已修剪旧全量备份: {}", file_name(&path));
        }
        Ok(())
    }
}

/// 结构化校验：回读的检查点必须与要求写入的一致
fn verify_written(written: &Checkpoint, requested: &Checkpoint) -> AppResult<()> {
    if written.updated_colors.len() != requested.updated_colors.len() {
        return Err(AppError::verification_mismatch(
            "updatedColors.len",
            requested.updated_colors.len(),
            written.updated_colors.len(),
        ));
    }
    if written.stats.updated != requested.stats.updated {
        return Err(AppError::verification_mismatch(
            "stats.updated",
            requested.stats.updated,
            written.stats.updated,
        ));
    }
    if written.current_index != requested.current_index {
        return Err(AppError::verification_mismatch(
            "currentIndex",
            requested.current_index,
            written.current_index,
        ));
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap_or_default().to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str, hex: &str) -> ColorEntry {
        ColorEntry {
            code: code.to_string(),
            name: format!("颜色{}", code),
            brand: "测试品牌".to_string(),
            hex: hex.to_string(),
        }
    }

    fn store_in(dir: &Path) -> CheckpointStore {
        let config = Config {
            checkpoint_file: dir.join("checkpoint.json").display().to_string(),
            backup_dir: dir.join("backups").display().to_string(),
            backup_retention: 2,
            ..Config::default()
        };
        CheckpointStore::new(&config)
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let checkpoint = store.load().await;
        assert_eq!(checkpoint.current_index, 0);
        assert!(checkpoint.updated_colors.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let colors = vec![entry("A", "#112233"), entry("B", "")];
        let mut stats = RunStats::default();
        stats.total = 2;
        stats.record_success("A");
        stats.record_failure("B");

        store.save(2, &colors, &stats).await.expect("保存应成功");

        let loaded = store.load().await;
        assert_eq!(loaded.current_index, 2);
        assert_eq!(loaded.updated_colors, colors);
        assert_eq!(loaded.stats, stats);
        assert_eq!(loaded.total_processed, 2);
    }

    #[tokio::test]
    async fn test_save_dedups_by_code_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        // 同一编号出现两次：持久化结果必须只有一条，取后出现的值
        let colors = vec![entry("A", ""), entry("B", "#445566"), entry("A", "#112233")];
        let stats = RunStats {
            total: 2,
            ..Default::default()
        };
        let saved = store.save(0, &colors, &stats).await.expect("保存应成功");

        assert_eq!(saved.updated_colors.len(), 2);
        assert_eq!(saved.updated_colors[0].code, "A");
        assert_eq!(saved.updated_colors[0].hex, "#112233");
        assert_eq!(saved.updated_colors[1].code, "B");
    }

    #[tokio::test]
    async fn test_save_writes_full_backup_of_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let stats = RunStats::default();

        store.save(1, &[entry("A", "")], &stats).await.unwrap();
        store.save(2, &[entry("A", "#112233")], &stats).await.unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(FULL_BACKUP_PREFIX))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_rapid_saves_keep_distinct_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let stats = RunStats::default();

        // 同一秒内的连续保存：备份文件名带毫秒，互不覆盖
        store.save(1, &[entry("A", "")], &stats).await.unwrap();
        store.save(2, &[entry("A", "#112233")], &stats).await.unwrap();
        store.save(3, &[entry("A", "#445566")], &stats).await.unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(FULL_BACKUP_PREFIX))
            .collect();
        assert_eq!(backups.len(), 2);
    }

    #[tokio::test]
    async fn test_emergency_backup_carries_signal_and_reason() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let checkpoint = Checkpoint::empty();

        let path = store
            .write_emergency(&checkpoint, "SIGINT", "收到中断信号")
            .await
            .expect("紧急备份应成功");

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["signal"], "SIGINT");
        assert_eq!(value["reason"], "收到中断信号");
        assert!(value["savedAt"].is_string());
        assert!(value["currentIndex"].is_number());
    }

    #[test]
    fn test_verification_gate_fails_loudly_on_mismatch() {
        let mut requested = Checkpoint::empty();
        requested.updated_colors.push(entry("A", "#112233"));
        requested.stats.updated = 1;

        // 统计对不上：该次保存必须判定失败
        let mut corrupted = requested.clone();
        corrupted.stats.updated = 0;
        assert!(verify_written(&corrupted, &requested).is_err());

        // 条目数对不上也一样
        let mut truncated = requested.clone();
        truncated.updated_colors.clear();
        assert!(verify_written(&truncated, &requested).is_err());

        assert!(verify_written(&requested.clone(), &requested).is_ok());
    }
}
