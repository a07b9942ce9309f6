//! 颜色清单加载器
//!
//! 启动时从结构化的 TOML 数据文件加载待处理颜色清单。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::models::color::ColorEntry;

/// TOML 数据文件的顶层结构
#[derive(Debug, Deserialize)]
struct ColorFile {
    #[serde(default)]
    colors: Vec<ColorEntry>,
}

/// 从 TOML 文件加载颜色清单
///
/// 重复编号只保留首次出现的条目（记录警告）。
pub async fn load_color_backlog(path: &str) -> Result<Vec<ColorEntry>> {
    let file = Path::new(path);
    if !file.exists() {
        anyhow::bail!("颜色数据文件不存在: {}", path);
    }

    let content = fs::read_to_string(file)
        .await
        .with_context(|| format!("无法读取颜色数据文件: {}", path))?;

    let parsed: ColorFile =
        toml::from_str(&content).with_context(|| format!("无法解析颜色数据文件: {}", path))?;

    let mut seen = std::collections::HashSet::new();
    let mut backlog = Vec::with_capacity(parsed.colors.len());
    for entry in parsed.colors {
        if entry.code.trim().is_empty() {
            warn!("⚠️ 跳过编号为空的颜色条目: {}", entry.name);
            continue;
        }
        if !seen.insert(entry.code.clone()) {
            warn!("⚠️ 跳过重复编号的颜色条目: {}", entry.code);
            continue;
        }
        backlog.push(entry);
    }

    info!("✓ 已加载 {} 个待处理颜色", backlog.len());
    Ok(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_backlog_skips_duplicates_and_empty_codes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r##"
[[colors]]
code = "A01"
name = "朱砂红"

[[colors]]
code = "A01"
name = "重复条目"

[[colors]]
code = ""
name = "编号为空"

[[colors]]
code = "B02"
name = "黛蓝"
brand = "某品牌"
hex = "#112233"
"##
        )
        .unwrap();

        let backlog = load_color_backlog(file.path().to_str().unwrap())
            .await
            .expect("应能加载清单");
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].code, "A01");
        assert_eq!(backlog[0].brand, crate::models::color::DEFAULT_BRAND);
        assert_eq!(backlog[1].code, "B02");
        assert_eq!(backlog[1].hex, "#112233");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let result = load_color_backlog("/不存在/colors.toml").await;
        assert!(result.is_err());
    }
}
