//! 检查点数据模型
//!
//! 检查点是可恢复性的唯一权威载体：游标、已更新的颜色集合、
//! 运行统计与最近更新时间。文件格式兼容旧版编码
//! （`updatedColors` 里的条目可能是 JSON 字符串而非结构化对象）。

use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::models::color::{ColorEntry, RunStats};

/// 备份元信息（记录最近一次备份的类型与版本）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// 备份类型（"full" 或 "incremental"）
    #[serde(rename = "type")]
    pub kind: String,
    /// 备份时间戳
    pub timestamp: String,
    /// 备份版本号
    pub version: u64,
}

/// 检查点：一次运行的可持久化状态
///
/// 顺序模式下 `current_index` 是下一个未处理位置；
/// 增量对账模式下表示"本轮已处理数量"。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// 进度游标
    pub current_index: usize,
    /// 已处理的颜色结果集（按编号去重，保持插入顺序）
    #[serde(deserialize_with = "deserialize_color_entries")]
    pub updated_colors: Vec<ColorEntry>,
    /// 运行统计
    pub stats: RunStats,
    /// 最近更新时间（ISO-8601）
    pub last_updated: String,
    /// 累计已处理数量
    pub total_processed: usize,
    /// 最近一次备份信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_info: Option<BackupInfo>,
}

impl Checkpoint {
    /// 创建全新的空检查点
    pub fn empty() -> Self {
        Self {
            current_index: 0,
            updated_colors: Vec::new(),
            stats: RunStats::default(),
            last_updated: now_iso8601(),
            total_processed: 0,
            backup_info: None,
        }
    }
}

/// 当前时间的 ISO-8601 字符串
pub fn now_iso8601() -> String {
    Local::now().to_rfc3339()
}

/// 文件名用的时间戳（`20240131_235959_123` 形式）
///
/// 带毫秒分量：同一秒内的连续保存不会互相覆盖备份文件。
pub fn file_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// 按编号去重，后写的值覆盖先写的值，保持首次插入顺序
pub fn dedup_colors(colors: Vec<ColorEntry>) -> Vec<ColorEntry> {
    let mut positions = std::collections::HashMap::new();
    let mut deduped: Vec<ColorEntry> = Vec::with_capacity(colors.len());
    for entry in colors {
        match positions.get(&entry.code) {
            Some(&index) => {
                let slot: &mut ColorEntry = &mut deduped[index];
                *slot = entry;
            }
            None => {
                positions.insert(entry.code.clone(), deduped.len());
                deduped.push(entry);
            }
        }
    }
    deduped
}

// ========== 旧版编码兼容 ==========

/// 旧版检查点把每个条目存成 JSON 字符串，这里统一归一化为结构化对象
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyColorEntry {
    Structured(ColorEntry),
    Encoded(String),
}

fn deserialize_color_entries<'de, D>(deserializer: D) -> Result<Vec<ColorEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<LegacyColorEntry> = Vec::deserialize(deserializer)?;
    let mut entries = Vec::with_capacity(raw.len());
    for item in raw {
        match item {
            LegacyColorEntry::Structured(entry) => entries.push(entry),
            LegacyColorEntry::Encoded(text) => match serde_json::from_str::<ColorEntry>(&text) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("⚠️ 跳过无法解析的旧版检查点条目: {}", e);
                }
            },
        }
    }
    Ok(entries)
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

    #[test]
    fn test_dedup_last_write_wins_keeps_order() {
        let colors = vec![
            entry("A", ""),
            entry("B", "#112233"),
            entry("A", "#FFEEDD"),
            entry("C", ""),
        ];
        let deduped = dedup_colors(colors);
        let codes: Vec<&str> = deduped.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["A", "B", "C"]);
        assert_eq!(deduped[0].hex, "#FFEEDD");
    }

    #[test]
    fn test_file_timestamp_has_millisecond_precision() {
        let ts = file_timestamp();
        // 20240131_235959_123 形式
        assert_eq!(ts.len(), 19);
        let parts: Vec<&str> = ts.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 3);
        assert!(ts.chars().all(|c| c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_load_legacy_string_entries() {
        let json = r##"{
            "currentIndex": 2,
            "updatedColors": [
                "{\"code\":\"A\",\"name\":\"甲\",\"brand\":\"测试\",\"hex\":\"#112233\"}",
                {"code": "B", "name": "乙", "brand": "测试", "hex": ""}
            ],
            "stats": {"total": 2, "updated": 1, "failed": 1, "skipped": 0},
            "lastUpdated": "2024-01-01T00:00:00+08:00",
            "totalProcessed": 2
        }"##;
        let checkpoint: Checkpoint = serde_json::from_str(json).expect("应能解析旧版检查点");
        assert_eq!(checkpoint.updated_colors.len(), 2);
        assert_eq!(checkpoint.updated_colors[0].code, "A");
        assert_eq!(checkpoint.updated_colors[0].hex, "#112233");
        assert_eq!(checkpoint.updated_colors[1].code, "B");
    }

    #[test]
    fn test_legacy_bad_entry_is_skipped_not_fatal() {
        let json = r#"{
            "currentIndex": 0,
            "updatedColors": ["这不是JSON"],
            "stats": {"total": 0, "updated": 0, "failed": 0, "skipped": 0},
            "lastUpdated": "2024-01-01T00:00:00+08:00",
            "totalProcessed": 0
        }"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).expect("坏条目只跳过不报错");
        assert!(checkpoint.updated_colors.is_empty());
    }

    #[test]
    fn test_roundtrip_keeps_camel_case_contract() {
        let mut checkpoint = Checkpoint::empty();
        checkpoint.updated_colors.push(entry("A", "#112233"));
        checkpoint.stats.total = 1;
        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(json.contains("\"currentIndex\""));
        assert!(json.contains("\"updatedColors\""));
        assert!(json.contains("\"lastUpdated\""));
        assert!(json.contains("\"totalProcessed\""));
        assert!(json.contains("\"failedIdentifiers\""));
    }
}
