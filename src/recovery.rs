//! 错误分类与恢复决策
//!
//! 把一个原始错误映射为类型化的错误类别（`ErrorKind`），
//! 再根据类别和同一位置的既往尝试次数给出恢复动作（`RecoveryAction`）。
//! 分类是基于错误消息模式的启发式匹配，不保证准确，
//! 匹配不上的一律归入 `Unknown`。

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AppError, BrowserError, ConfigError, DataError, FileError};

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 会话崩溃（浏览器进程/连接失效）
    SessionCrash,
    /// 页面崩溃
    PageCrash,
    /// 页面元素未找到
    ElementNotFound,
    /// 数据解析失败
    DataParse,
    /// 数据校验失败
    DataValidation,
    /// 文件不存在
    FileNotFound,
    /// 文件权限不足
    FilePermission,
    /// 配置错误
    Config,
    /// 参数错误
    Parameter,
    /// 未知错误
    Unknown,
}

/// 恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 立即重试
    RetryImmediately,
    /// 固定延迟后重试
    RetryWithDelay,
    /// 递增退避后重试
    RetryWithBackoff,
    /// 重建所属资源（会话）
    RecreateResource,
    /// 跳过当前条目
    SkipCurrent,
    /// 回退到安全状态
    FallbackToSafeState,
    /// 终止整个流程
    Terminate,
}

/// 一次恢复决策的结果
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// 错误类别
    pub kind: ErrorKind,
    /// 恢复动作
    pub action: RecoveryAction,
    /// 重试前的等待时间
    pub retry_delay: Duration,
    /// 针对该类错误覆盖的最大尝试次数（None 表示沿用调用方默认）
    pub max_attempts_override: Option<usize>,
}

/// 错误发生时的上下文（操作名 + 涉及的资源）
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// 操作名（同时作为尝试计数的位置键）
    pub operation: String,
    /// 涉及的资源（仅用于日志）
    pub resource: Option<String>,
}

impl ErrorContext {
    /// 创建新的错误上下文
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            resource: None,
        }
    }

    /// 附加资源信息
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

// ========== 分类 ==========

/// 按结构化的 `AppError` 变体精确分类
pub fn classify_app_error(error: &AppError) -> ErrorKind {
    match error {
        AppError::Browser(e) => match e {
            BrowserError::LaunchFailed { .. } | BrowserError::SessionCrashed { .. } => {
                ErrorKind::SessionCrash
            }
            BrowserError::PageCreationFailed { .. } => ErrorKind::PageCrash,
            BrowserError::NavigationFailed { .. } => ErrorKind::Network,
            BrowserError::WaitTimeout { .. } => ErrorKind::Timeout,
            BrowserError::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            BrowserError::PoolInitFailed { .. } => ErrorKind::Config,
            BrowserError::ScriptExecutionFailed { source } => {
                classify_message(&source.to_string())
            }
        },
        AppError::File(e) => match e {
            FileError::NotFound { .. } => ErrorKind::FileNotFound,
            FileError::PermissionDenied { .. } => ErrorKind::FilePermission,
            FileError::TomlParseFailed { .. } => ErrorKind::DataParse,
            FileError::ReadFailed { .. } | FileError::WriteFailed { .. } => {
                ErrorKind::FileNotFound
            }
        },
        AppError::Data(e) => match e {
            DataError::ParseFailed { .. } | DataError::JsonParseFailed { .. } => {
                ErrorKind::DataParse
            }
            DataError::ValidationFailed { .. } | DataError::VerificationMismatch { .. } => {
                ErrorKind::DataValidation
            }
        },
        AppError::Config(e) => match e {
            ConfigError::InvalidValue { .. } => ErrorKind::Config,
            ConfigError::MissingValue { .. } => ErrorKind::Parameter,
        },
        AppError::Other(msg) => classify_message(msg),
    }
}

/// 按错误消息启发式分类（尽力而为，匹配不上归入 Unknown）
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    // 崩溃类优先于网络类，"target closed" 往往同时带着连接错误字样
    if lower.contains("browser closed")
        || lower.contains("session closed")
        || lower.contains("target closed")
        || lower.contains("channel closed")
        || lower.contains("websocket")
        || lower.contains("会话")
    {
        return ErrorKind::SessionCrash;
    }
    if lower.contains("crashed") || lower.contains("inspected target") || lower.contains("页面崩溃")
    {
        return ErrorKind::PageCrash;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("超时") {
        return ErrorKind::Timeout;
    }
    if lower.contains("net::")
        || lower.contains("connection")
        || lower.contains("refused")
        || lower.contains("reset")
        || lower.contains("dns")
        || lower.contains("连接")
    {
        return ErrorKind::Network;
    }
    if lower.contains("element") || lower.contains("selector") || lower.contains("未找到元素") {
        return ErrorKind::ElementNotFound;
    }
    if lower.contains("permission denied") || lower.contains("access denied") || lower.contains("权限")
    {
        return ErrorKind::FilePermission;
    }
    if lower.contains("no such file") || lower.contains("文件不存在") {
        return ErrorKind::FileNotFound;
    }
    if lower.contains("parse") || lower.contains("解析") || lower.contains("invalid json") {
        return ErrorKind::DataParse;
    }
    if lower.contains("validation") || lower.contains("校验") {
        return ErrorKind::DataValidation;
    }
    if lower.contains("config") || lower.contains("配置") {
        return ErrorKind::Config;
    }
    if lower.contains("parameter") || lower.contains("argument") || lower.contains("参数") {
        return ErrorKind::Parameter;
    }

    ErrorKind::Unknown
}

// ========== 恢复决策 ==========

/// 网络类退避的基准延迟
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// 网络类退避的延迟上限
const BACKOFF_CAP: Duration = Duration::from_secs(10);
/// 超时类重试的固定延迟
const TIMEOUT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 恢复决策器
///
/// 按 `(错误类别, 位置)` 记录既往尝试次数，
/// 同一类错误在同一位置反复出现时逐步收紧决策。
#[derive(Debug, Default)]
pub struct RecoveryPlanner {
    attempts: HashMap<(ErrorKind, String), usize>,
}

impl RecoveryPlanner {
    /// 创建新的恢复决策器
    pub fn new() -> Self {
        Self::default()
    }

    /// 针对一个已分类错误给出恢复决策，并累计该位置的尝试次数
    pub fn plan(&mut self, kind: ErrorKind, ctx: &ErrorContext) -> RecoveryPlan {
        let key = (kind, ctx.operation.clone());
        let prior = *self.attempts.get(&key).unwrap_or(&0);
        *self.attempts.entry(key).or_insert(0) += 1;

        let (action, retry_delay, max_attempts_override) = match kind {
            ErrorKind::Network => {
                if prior < 5 {
                    // 指数退避，封顶
                    let factor = 1u32 << prior.min(5) as u32;
                    let delay = BACKOFF_BASE
                        .checked_mul(factor)
                        .unwrap_or(BACKOFF_CAP)
                        .min(BACKOFF_CAP);
                    (RecoveryAction::RetryWithBackoff, delay, Some(5))
                } else {
                    (RecoveryAction::SkipCurrent, Duration::ZERO, Some(5))
                }
            }
            ErrorKind::Timeout => {
                if prior < 3 {
                    (RecoveryAction::RetryWithDelay, TIMEOUT_RETRY_DELAY, Some(3))
                } else {
                    (RecoveryAction::SkipCurrent, Duration::ZERO, Some(3))
                }
            }
            ErrorKind::SessionCrash | ErrorKind::PageCrash => {
                (RecoveryAction::RecreateResource, Duration::ZERO, Some(1))
            }
            ErrorKind::ElementNotFound => {
                if prior < 2 {
                    (RecoveryAction::RetryWithDelay, TIMEOUT_RETRY_DELAY, Some(2))
                } else {
                    (RecoveryAction::SkipCurrent, Duration::ZERO, Some(2))
                }
            }
            // 条目级数据问题：换条数据就好，重试没有意义
            ErrorKind::DataParse | ErrorKind::DataValidation => {
                (RecoveryAction::SkipCurrent, Duration::ZERO, Some(1))
            }
            // 全局性问题：重试没有意义，直接终止
            ErrorKind::FileNotFound
            | ErrorKind::FilePermission
            | ErrorKind::Config
            | ErrorKind::Parameter => (RecoveryAction::Terminate, Duration::ZERO, Some(1)),
            ErrorKind::Unknown => {
                if prior == 0 {
                    (RecoveryAction::RetryWithDelay, TIMEOUT_RETRY_DELAY, Some(2))
                } else {
                    (RecoveryAction::SkipCurrent, Duration::ZERO, Some(2))
                }
            }
        };

        RecoveryPlan {
            kind,
            action,
            retry_delay,
            max_attempts_override,
        }
    }

    /// 针对一个 `AppError` 分类并决策
    pub fn plan_for(&mut self, error: &AppError, ctx: &ErrorContext) -> RecoveryPlan {
        self.plan(classify_app_error(error), ctx)
    }

    /// 清空某个位置的尝试计数（操作成功后调用）
    pub fn reset(&mut self, ctx: &ErrorContext) {
        self.attempts.retain(|(_, op), _| op != &ctx.operation);
    }
}
