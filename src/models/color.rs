//! 颜色数据模型
//!
//! 定义待补全的颜色条目（`ColorEntry`）、运行统计（`RunStats`），
//! 以及颜色值的归一化与校验逻辑。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 品牌缺失时使用的默认色卡品牌
pub const DEFAULT_BRAND: &str = "千色卡";

fn default_brand() -> String {
    DEFAULT_BRAND.to_string()
}

/// 一条待补全的颜色记录
///
/// `code` 在整个数据集中唯一且跨运行稳定；`hex` 要么为空字符串，
/// 要么是严格的 `#RRGGBB` 大写形式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorEntry {
    /// 颜色编号（唯一标识）
    pub code: String,
    /// 颜色名称
    pub name: String,
    /// 所属品牌（缺失时使用默认色卡品牌）
    #[serde(default = "default_brand")]
    pub brand: String,
    /// 十六进制颜色值（空表示尚未补全）
    #[serde(default)]
    pub hex: String,
}

impl ColorEntry {
    /// 创建新的颜色条目
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            brand: default_brand(),
            hex: String::new(),
        }
    }

    /// 是否已持有合法的十六进制颜色值
    pub fn has_valid_hex(&self) -> bool {
        is_valid_hex(&self.hex)
    }

    /// 搜索用的查询词（品牌 + 颜色名）
    pub fn search_query(&self) -> String {
        format!("{} {}", self.brand, self.name)
    }
}

/// 一次运行的汇总统计
///
/// `failed_identifiers` 与 `successful_identifiers` 互斥：
/// 同一个编号任意时刻只会出现在其中一个集合里，
/// 重试成功后从前者移入后者。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    /// 待处理总数
    pub total: usize,
    /// 成功更新数
    pub updated: usize,
    /// 失败数
    pub failed: usize,
    /// 跳过数（已持有合法颜色值）
    pub skipped: usize,
    /// 仍然失败的颜色编号
    #[serde(default)]
    pub failed_identifiers: Vec<String>,
    /// 已成功的颜色编号
    #[serde(default)]
    pub successful_identifiers: Vec<String>,
}

impl RunStats {
    /// 记录一次成功：编号从失败集合移入成功集合
    pub fn record_success(&mut self, code: &str) {
        self.updated += 1;
        self.failed_identifiers.retain(|c| c != code);
        if !self.successful_identifiers.iter().any(|c| c == code) {
            self.successful_identifiers.push(code.to_string());
        }
    }

    /// 记录一次失败
    ///
    /// 已经成功过的编号不会被重新标记为失败（成功状态保持）。
    pub fn record_failure(&mut self, code: &str) {
        self.failed += 1;
        if self.successful_identifiers.iter().any(|c| c == code) {
            return;
        }
        if !self.failed_identifiers.iter().any(|c| c == code) {
            self.failed_identifiers.push(code.to_string());
        }
    }

    /// 记录一次跳过
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// 校验软不变量 `total == updated + failed + skipped`
    ///
    /// 不满足时只记录日志，绝不中断流程。
    pub fn check_consistency(&self) {
        let sum = self.updated + self.failed + self.skipped;
        if self.total != sum {
            tracing::warn!(
                "⚠️ 统计不一致: total={} 但 updated+failed+skipped={}",
                self.total,
                sum
            );
        }
    }

    /// 成功率（百分比，分母为已处理数）
    pub fn success_rate(&self) -> f64 {
        let processed = self.updated + self.failed;
        if processed == 0 {
            return 0.0;
        }
        self.updated as f64 / processed as f64 * 100.0
    }
}

// ========== 颜色值归一化 ==========

fn hex_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^#[0-9A-F]{6}$").expect("合法的正则表达式"))
}

fn rgb_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^rgba?\(\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})")
            .expect("合法的正则表达式")
    })
}

/// 判断是否为严格的 `#RRGGBB` 大写十六进制颜色值
pub fn is_valid_hex(value: &str) -> bool {
    hex_pattern().is_match(value)
}

/// 将页面上读到的原始颜色值归一化为 `#RRGGBB` 大写形式
///
/// 支持两种输入：
/// - `rgb(r, g, b)` / `rgba(r, g, b, a)` 文本形式
/// - 已经是十六进制的形式（统一转大写后按严格模式校验）
///
/// 无法归一化时返回 `None`。
pub fn normalize_color_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // rgb(r, g, b) 文本形式
    if let Some(caps) = rgb_pattern().captures(trimmed) {
        let r: u32 = caps[1].parse().ok()?;
        let g: u32 = caps[2].parse().ok()?;
        let b: u32 = caps[3].parse().ok()?;
        if r > 255 || g > 255 || b > 255 {
            return None;
        }
        return Some(format!("#{:02X}{:02X}{:02X}", r, g, b));
    }

    // 十六进制形式：统一大写后严格校验
    let upper = trimmed.to_uppercase();
    let candidate = if upper.starts_with('#') {
        upper
    } else {
        format!("#{}", upper)
    };
    if is_valid_hex(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rgb_triplet() {
        assert_eq!(
            normalize_color_value("rgb(17, 34, 51)").as_deref(),
            Some("#112233")
        );
        assert_eq!(
            normalize_color_value("rgba(255, 0, 128, 0.5)").as_deref(),
            Some("#FF0080")
        );
        // 分量越界
        assert_eq!(normalize_color_value("rgb(300, 0, 0)"), None);
    }

    #[test]
    fn test_normalize_hex_forms() {
        assert_eq!(normalize_color_value("#aabbcc").as_deref(), Some("#AABBCC"));
        assert_eq!(normalize_color_value("AABBCC").as_deref(), Some("#AABBCC"));
        assert_eq!(normalize_color_value("  #112233 ").as_deref(), Some("#112233"));
        // 非法输入
        assert_eq!(normalize_color_value("#abc"), None);
        assert_eq!(normalize_color_value("not a color"), None);
        assert_eq!(normalize_color_value(""), None);
    }

    #[test]
    fn test_is_valid_hex_is_strict() {
        assert!(is_valid_hex("#112233"));
        assert!(is_valid_hex("#FFFFFF"));
        assert!(!is_valid_hex("#ffffff")); // 必须大写
        assert!(!is_valid_hex("112233"));
        assert!(!is_valid_hex("#1122334"));
    }

    #[test]
    fn test_stats_success_moves_identifier() {
        let mut stats = RunStats::default();
        stats.record_failure("A01");
        assert_eq!(stats.failed_identifiers, vec!["A01"]);

        // 重试成功后编号必须从失败集合移入成功集合
        stats.record_success("A01");
        assert!(stats.failed_identifiers.is_empty());
        assert_eq!(stats.successful_identifiers, vec!["A01"]);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_stats_sets_are_mutually_exclusive() {
        let mut stats = RunStats::default();
        stats.record_success("B02");
        // 成功后的失败不会把编号拉回失败集合
        stats.record_failure("B02");
        assert!(stats.failed_identifiers.is_empty());
        assert_eq!(stats.successful_identifiers, vec!["B02"]);
    }

    #[test]
    fn test_search_query_contains_brand_and_name() {
        let entry = ColorEntry::new("A01", "朱砂红");
        assert_eq!(entry.search_query(), format!("{} 朱砂红", DEFAULT_BRAND));
    }
}
