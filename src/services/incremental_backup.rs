//! 增量备份存储
//!
//! 计算两份检查点之间的逐条目差异（新增/更新）与统计增量，
//! 以版本号落盘为 `incremental_<时间戳>.json`，超出保留份数后修剪。
//!
//! 增量快照仅用于诊断辅助：权威恢复永远走全量检查点，
//! 这里不提供从增量链重建全量状态的能力。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::models::checkpoint::{file_timestamp, now_iso8601, Checkpoint};
use crate::models::color::ColorEntry;

/// 增量快照文件名前缀
const INCREMENTAL_PREFIX: &str = "incremental_";

/// 两份统计之间的逐项增量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsDelta {
    pub total: i64,
    pub updated: i64,
    pub failed: i64,
    pub skipped: i64,
}

/// 一份增量快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalSnapshot {
    /// 版本号（单调递增）
    pub version: u64,
    /// 创建时间（ISO-8601）
    pub created_at: String,
    /// 相比上一份检查点新增的条目
    pub added: Vec<ColorEntry>,
    /// 相比上一份检查点发生变化的条目
    pub updated: Vec<ColorEntry>,
    /// 统计增量
    pub stats_delta: StatsDelta,
}

/// 计算两份检查点之间的增量
pub fn compute_diff(prev: &Checkpoint, next: &Checkpoint) -> IncrementalSnapshot {
    let mut added = Vec::new();
    let mut updated = Vec::new();

    for entry in &next.updated_colors {
        match prev.updated_colors.iter().find(|p| p.code == entry.code) {
            None => added.push(entry.clone()),
            Some(old) if old != entry => updated.push(entry.clone()),
            Some(_) => {}
        }
    }

    let stats_delta = StatsDelta {
        total: next.stats.total as i64 - prev.stats.total as i64,
        updated: next.stats.updated as i64 - prev.stats.updated as i64,
        failed: next.stats.failed as i64 - prev.stats.failed as i64,
        skipped: next.stats.skipped as i64 - prev.stats.skipped as i64,
    };

    IncrementalSnapshot {
        version: 0, // 落盘时由存储层填入
        created_at: now_iso8601(),
        added,
        updated,
        stats_delta,
    }
}

/// 增量备份存储
pub struct IncrementalBackupStore {
    dir: PathBuf,
    retention: usize,
}

impl IncrementalBackupStore {
    /// 创建新的增量备份存储
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    /// 计算并持久化一份增量快照，返回落盘路径与版本号
    pub async fn save_snapshot(
        &self,
        prev: &Checkpoint,
        next: &Checkpoint,
    ) -> Result<(PathBuf, u64)> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("无法创建备份目录: {}", self.dir.display()))?;

        let mut snapshot = compute_diff(prev, next);
        snapshot.version = self.next_version().await?;

        let path = self
            .dir
            .join(format!("{}{}.json", INCREMENTAL_PREFIX, file_timestamp()));
        let json = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("无法写入增量快照: {}", path.display()))?;

        debug!(
            "✓ 增量快照 v{} 已写入: 新增 {}, 变化 {}",
            snapshot.version,
            snapshot.added.len(),
            snapshot.updated.len()
        );

        self.prune().await?;
        Ok((path, snapshot.version))
    }

    /// 下一个版本号（现存快照的最大版本 + 1，修剪不回退版本）
    async fn next_version(&self) -> Result<u64> {
        let mut max_version = 0u64;
        for path in self.list_snapshots().await? {
            if let Ok(content) = fs::read_to_string(&path).await {
                if let Ok(snapshot) = serde_json::from_str::<IncrementalSnapshot>(&content) {
                    max_version = max_version.max(snapshot.version);
                }
            }
        }
        Ok(max_version + 1)
    }

    /// 修剪超出保留份数的旧快照（按文件名中的时间戳排序）
    async fn prune(&self) -> Result<()> {
        let mut snapshots = self.list_snapshots().await?;
        if snapshots.len() <= self.retention {
            return Ok(());
        }
        snapshots.sort();
        let excess = snapshots.len() - self.retention;
        for path in snapshots.into_iter().take(excess) {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("无法删除旧增量快照: {}", path.display()))?;
            info!("🗑️ 已修剪旧增量快照: {}", file_name(&path));
        }
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut result = Vec::new();
        if !self.dir.exists() {
            return Ok(result);
        }
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("无法读取备份目录: {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if file_name(&path).starts_with(INCREMENTAL_PREFIX)
                && path.extension().and_then(|s| s.to_str()) == Some("json")
            {
                result.push(path);
            }
        }
        Ok(result)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap_or_default().to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::color::RunStats;

    fn entry(code: &str, hex: &str) -> ColorEntry {
        ColorEntry {
            code: code.to_string(),
            name: format!("颜色{}", code),
            brand: "测试品牌".to_string(),
            hex: hex.to_string(),
        }
    }

    fn checkpoint(colors: Vec<ColorEntry>, updated: usize) -> Checkpoint {
        let mut ck = Checkpoint::empty();
        ck.updated_colors = colors;
        ck.stats = RunStats {
            total: 10,
            updated,
            ..Default::default()
        };
        ck
    }

    #[test]
    fn test_diff_detects_added_and_updated() {
        let prev = checkpoint(vec![entry("A", ""), entry("B", "#112233")], 1);
        let next = checkpoint(
            vec![entry("A", "#AABBCC"), entry("B", "#112233"), entry("C", "")],
            2,
        );

        let diff = compute_diff(&prev, &next);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].code, "C");
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].code, "A");
        assert_eq!(diff.stats_delta.updated, 1);
        assert_eq!(diff.stats_delta.total, 0);
    }

    #[tokio::test]
    async fn test_snapshots_are_versioned_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = IncrementalBackupStore::new(dir.path(), 2);
        let prev = checkpoint(vec![], 0);

        let mut last_version = 0;
        for i in 0..4 {
            let next = checkpoint(vec![entry(&format!("C{}", i), "#112233")], i);
            let (_, version) = store.save_snapshot(&prev, &next).await.unwrap();
            last_version = version;
            // 文件名带毫秒分量，轻微错开即可保证互不覆盖
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(last_version, 4); // 版本号不因修剪回退
        let remaining = store.list_snapshots().await.unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
