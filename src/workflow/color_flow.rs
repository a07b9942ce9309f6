//! 颜色提取流程 - 流程层
//!
//! 核心职责：定义"一个颜色"的完整提取协议
//!
//! 流程顺序：
//! 1. 导航到搜索页
//! 2. 输入查询词 → 点击搜索 → 短暂等待页面稳定
//! 3. 求值读取色块的颜色值 → 归一化为 `#RRGGBB`
//!
//! 任何一步失败都返回原始条目（绝不向上抛错），
//! 失败通过"hex 未变化"隐式传达，由编排层对比前后值归类。

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::infrastructure::PageOps;
use crate::models::color::{normalize_color_value, ColorEntry};
use crate::recovery::classify_app_error;
use crate::workflow::color_ctx::ColorCtx;

/// 搜索输入框选择器
const SEARCH_INPUT: &str = "#searchInput, input[name='colorSearch']";
/// 搜索按钮选择器
const SEARCH_BUTTON: &str = "#searchBtn, button[type='submit']";
/// 搜索结果里第一个色块的选择器
const RESULT_SWATCH: &str = ".se-color-item .color-block, .color-result .swatch";

/// 从搜索结果第一个色块读取颜色值的脚本
///
/// 优先级：data-hex 属性 → 行内样式 → 计算样式。
const READ_COLOR_JS: &str = r#"
(() => {
    const el = document.querySelector(".se-color-item .color-block, .color-result .swatch");
    if (!el) return null;
    const value = el.getAttribute('data-hex')
        || el.style.backgroundColor
        || window.getComputedStyle(el).backgroundColor;
    return value || null;
})()
"#;

/// 颜色提取流程
///
/// - 编排完整的单颜色提取协议
/// - 不持有任何资源（page 由门面借用）
/// - 失败对外只表现为"条目未变化"
#[derive(Debug, Clone)]
pub struct ColorFlow {
    target_url: String,
    settle_delay_ms: u64,
    verbose_logging: bool,
}

impl ColorFlow {
    /// 创建新的颜色提取流程
    pub fn new(config: &Config) -> Self {
        Self {
            target_url: config.target_url.clone(),
            settle_delay_ms: config.settle_delay_ms,
            verbose_logging: config.verbose_logging,
        }
    }

    /// 提取一个颜色的十六进制值
    ///
    /// 成功时返回补全了 `hex` 的新条目；任何失败都返回
    /// 原始条目的拷贝，错误不越过本函数边界。
    pub async fn extract(&self, ops: &PageOps<'_>, entry: &ColorEntry, ctx: &ColorCtx) -> ColorEntry {
        match self.try_extract(ops, entry, ctx).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(
                    "{} ⚠️ 提取失败 ({:?}): {}",
                    ctx,
                    classify_app_error(&e),
                    e
                );
                entry.clone()
            }
        }
    }

    async fn try_extract(
        &self,
        ops: &PageOps<'_>,
        entry: &ColorEntry,
        ctx: &ColorCtx,
    ) -> crate::error::AppResult<ColorEntry> {
        let query = entry.search_query();
        info!("{} 🔍 搜索: {}", ctx, query);

        // 1. 导航到搜索页
        ops.navigate(&self.target_url).await?;
        ops.wait_for_element(SEARCH_INPUT).await?;

        // 2. 输入查询词并搜索
        ops.type_text(SEARCH_INPUT, &query).await?;
        ops.click(SEARCH_BUTTON).await?;

        // 3. 等待页面稳定后读取结果
        ops.delay(self.settle_delay_ms).await;
        let raw: Option<String> = ops.eval_as(READ_COLOR_JS).await?;

        let raw = raw.ok_or_else(|| {
            crate::error::AppError::element_not_found(RESULT_SWATCH)
        })?;
        if self.verbose_logging {
            debug!("{} 页面原始颜色值: {}", ctx, raw);
        }

        // 4. 归一化并校验
        let hex = normalize_color_value(&raw).ok_or_else(|| {
            crate::error::AppError::Data(crate::error::DataError::ParseFailed {
                value: raw.clone(),
                reason: "无法归一化为 #RRGGBB".to_string(),
            })
        })?;

        info!("{} ✓ 提取成功: {}", ctx, hex);
        let mut updated = entry.clone();
        updated.hex = hex;
        Ok(updated)
    }
}
