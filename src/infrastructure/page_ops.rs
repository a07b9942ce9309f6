//! 页面操作门面 - 基础设施层
//!
//! 包装一个借来的会话页面，暴露导航/输入/点击/等待/求值等原语。
//! 每个原语独立重试（有限次数 + 固定或退避延迟），重试决策
//! 交给恢复决策器；重试耗尽后抛出已分类的错误，由调用方
//! （颜色提取流程）按"条目级失败"处理。

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::recovery::{ErrorContext, RecoveryAction, RecoveryPlanner};

/// 单个原语的默认最大尝试次数
const DEFAULT_MAX_ATTEMPTS: usize = 3;
/// 逐字符输入的字符间延迟
const TYPE_CHAR_DELAY: Duration = Duration::from_millis(30);
/// 等待条件的轮询间隔
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// 等待元素出现的默认超时
const ELEMENT_WAIT_TIMEOUT_MS: u64 = 10_000;
/// 等待元素可点击的超时
const CLICKABLE_WAIT_TIMEOUT_MS: u64 = 5_000;

/// 页面操作门面
///
/// 职责：
/// - 借用唯一的 Page 资源
/// - 暴露带重试的操作原语
/// - 不认识颜色条目，不处理业务流程
pub struct PageOps<'a> {
    page: &'a Page,
    max_attempts: usize,
    planner: Mutex<RecoveryPlanner>,
}

impl<'a> PageOps<'a> {
    /// 创建新的页面操作门面
    pub fn new(page: &'a Page) -> Self {
        Self {
            page,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            planner: Mutex::new(RecoveryPlanner::new()),
        }
    }

    /// 获取 page 的引用（用于其他操作）
    pub fn page(&self) -> &Page {
        self.page
    }

    /// 导航到指定 URL
    pub async fn navigate(&self, url: &str) -> AppResult<()> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let result = async {
                self.page
                    .goto(url)
                    .await
                    .map_err(|e| AppError::navigation_failed(url, e))?;
                self.page
                    .wait_for_navigation()
                    .await
                    .map_err(|e| AppError::navigation_failed(url, e))?;
                Ok::<(), AppError>(())
            }
            .await;

            match result {
                Ok(()) => {
                    debug!("✓ 已导航到: {}", url);
                    self.reset_attempts("navigate");
                    return Ok(());
                }
                Err(e) => {
                    if !self.should_retry("navigate", attempt, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// 向输入框输入文本
    ///
    /// 先清空目标并派发一次 input 事件，再逐字符输入（带字符间延迟）。
    pub async fn type_text(&self, selector: &str, text: &str) -> AppResult<()> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.type_text_once(selector, text).await {
                Ok(()) => {
                    debug!("✓ 已输入文本到 {} ({} 字符)", selector, text.chars().count());
                    self.reset_attempts("type_text");
                    return Ok(());
                }
                Err(e) => {
                    if !self.should_retry("type_text", attempt, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn type_text_once(&self, selector: &str, text: &str) -> AppResult<()> {
        let selector_json = serde_json::to_string(selector)?;

        // 清空并派发 input 事件
        let clear_js = format!(
            r#"
            (() => {{
                const el = document.querySelector({selector});
                if (!el) return false;
                el.value = '';
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                return true;
            }})()
            "#,
            selector = selector_json
        );
        let found: bool = self.eval_once(&clear_js).await?;
        if !found {
            return Err(AppError::element_not_found(selector));
        }

        // 逐字符输入
        for ch in text.chars() {
            let ch_json = serde_json::to_string(&ch.to_string())?;
            let append_js = format!(
                r#"
                (() => {{
                    const el = document.querySelector({selector});
                    if (!el) return false;
                    el.value = el.value + {ch};
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    return true;
                }})()
                "#,
                selector = selector_json,
                ch = ch_json
            );
            let ok: bool = self.eval_once(&append_js).await?;
            if !ok {
                return Err(AppError::element_not_found(selector));
            }
            sleep(TYPE_CHAR_DELAY).await;
        }
        Ok(())
    }

    /// 点击元素（先等待其可见且可用）
    pub async fn click(&self, selector: &str) -> AppResult<()> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.click_once(selector).await {
                Ok(()) => {
                    debug!("✓ 已点击: {}", selector);
                    self.reset_attempts("click");
                    return Ok(());
                }
                Err(e) => {
                    if !self.should_retry("click", attempt, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn click_once(&self, selector: &str) -> AppResult<()> {
        let selector_json = serde_json::to_string(selector)?;
        let clickable_js = format!(
            r#"
            (() => {{
                const el = document.querySelector({selector});
                if (!el || el.disabled) return false;
                const style = window.getComputedStyle(el);
                if (style.display === 'none' || style.visibility === 'hidden') return false;
                return el.offsetParent !== null || el === document.body;
            }})()
            "#,
            selector = selector_json
        );
        self.poll_condition(
            &format!("元素 {} 可点击", selector),
            &clickable_js,
            CLICKABLE_WAIT_TIMEOUT_MS,
        )
        .await?;

        let click_js = format!(
            r#"
            (() => {{
                const el = document.querySelector({selector});
                if (!el) return false;
                el.click();
                return true;
            }})()
            "#,
            selector = selector_json
        );
        let ok: bool = self.eval_once(&click_js).await?;
        if !ok {
            return Err(AppError::element_not_found(selector));
        }
        Ok(())
    }

    /// 等待元素出现
    pub async fn wait_for_element(&self, selector: &str) -> AppResult<()> {
        let selector_json = serde_json::to_string(selector)?;
        let predicate = format!("!!document.querySelector({})", selector_json);
        self.wait_for_condition(&format!("元素 {}", selector), &predicate, ELEMENT_WAIT_TIMEOUT_MS)
            .await
    }

    /// 等待任意 JS 谓词成立
    pub async fn wait_for_condition(
        &self,
        what: &str,
        js_predicate: &str,
        timeout_ms: u64,
    ) -> AppResult<()> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.poll_condition(what, js_predicate, timeout_ms).await {
                Ok(()) => {
                    self.reset_attempts("wait_for_condition");
                    return Ok(());
                }
                Err(e) => {
                    if !self.should_retry("wait_for_condition", attempt, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn poll_condition(
        &self,
        what: &str,
        js_predicate: &str,
        timeout_ms: u64,
    ) -> AppResult<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let satisfied: bool = self.eval_once(js_predicate).await.unwrap_or(false);
            if satisfied {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AppError::wait_timeout(what, timeout_ms));
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn evaluate(&self, js_code: impl Into<String>) -> AppResult<JsonValue> {
        let js_code = js_code.into();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.eval_once::<JsonValue>(&js_code).await {
                Ok(value) => {
                    self.reset_attempts("evaluate");
                    return Ok(value);
                }
                Err(e) => {
                    if !self.should_retry("evaluate", attempt, &e).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> AppResult<T> {
        let value = self.evaluate(js_code).await?;
        let typed = serde_json::from_value(value)?;
        Ok(typed)
    }

    /// 显式延迟
    pub async fn delay(&self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    // ========== 内部辅助 ==========

    async fn eval_once<T: DeserializeOwned>(&self, js_code: &str) -> AppResult<T> {
        let result = self.page.evaluate(js_code.to_string()).await?;
        let value = result.into_value()?;
        Ok(value)
    }

    /// 根据恢复决策判断是否继续重试；需要等待时就地等待
    async fn should_retry(&self, operation: &str, attempt: usize, error: &AppError) -> bool {
        let plan = {
            let mut planner = self.planner.lock().expect("恢复决策器锁不可能中毒");
            planner.plan_for(error, &ErrorContext::new(operation))
        };
        let effective_max = plan
            .max_attempts_override
            .unwrap_or(self.max_attempts)
            .min(self.max_attempts);

        warn!(
            "⚠️ 操作 {} 第 {}/{} 次尝试失败 ({:?} → {:?}): {}",
            operation, attempt, effective_max, plan.kind, plan.action, error
        );

        if attempt >= effective_max {
            return false;
        }
        match plan.action {
            RecoveryAction::RetryImmediately => true,
            RecoveryAction::RetryWithDelay | RecoveryAction::RetryWithBackoff => {
                sleep(plan.retry_delay).await;
                true
            }
            // 重建资源/跳过/终止都不在原语层处理，立即上抛
            _ => false,
        }
    }

    fn reset_attempts(&self, operation: &str) {
        let mut planner = self.planner.lock().expect("恢复决策器锁不可能中毒");
        planner.reset(&ErrorContext::new(operation));
    }
}
