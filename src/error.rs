use std::fmt;

/// 应用程序错误类型
#[derive(Debug)]
pub enum AppError {
    /// 浏览器会话相关错误
    Browser(BrowserError),
    /// 文件操作错误
    File(FileError),
    /// 数据解析与校验错误
    Data(DataError),
    /// 配置错误
    Config(ConfigError),
    /// 其他错误（用于包装第三方库错误）
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Browser(e) => write!(f, "浏览器错误: {}", e),
            AppError::File(e) => write!(f, "文件错误: {}", e),
            AppError::Data(e) => write!(f, "数据错误: {}", e),
            AppError::Config(e) => write!(f, "配置错误: {}", e),
            AppError::Other(msg) => write!(f, "错误: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Browser(e) => Some(e),
            AppError::File(e) => Some(e),
            AppError::Data(e) => Some(e),
            AppError::Config(e) => Some(e),
            AppError::Other(_) => None,
        }
    }
}

/// 浏览器会话相关错误
#[derive(Debug)]
pub enum BrowserError {
    /// 启动无头浏览器失败
    LaunchFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 创建页面失败
    PageCreationFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 导航失败
    NavigationFailed {
        url: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 执行脚本失败
    ScriptExecutionFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 会话崩溃（底层浏览器进程或连接已失效）
    SessionCrashed {
        session_id: usize,
    },
    /// 页面元素未找到
    ElementNotFound {
        selector: String,
    },
    /// 等待条件超时
    WaitTimeout {
        what: String,
        timeout_ms: u64,
    },
    /// 会话池初始化失败
    PoolInitFailed {
        reason: String,
    },
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserError::LaunchFailed { source } => {
                write!(f, "启动无头浏览器失败: {}", source)
            }
            BrowserError::PageCreationFailed { source } => {
                write!(f, "创建页面失败: {}", source)
            }
            BrowserError::NavigationFailed { url, source } => {
                write!(f, "导航到 {} 失败: {}", url, source)
            }
            BrowserError::ScriptExecutionFailed { source } => {
                write!(f, "执行脚本失败: {}", source)
            }
            BrowserError::SessionCrashed { session_id } => {
                write!(f, "会话 {} 已崩溃", session_id)
            }
            BrowserError::ElementNotFound { selector } => {
                write!(f, "未找到页面元素: {}", selector)
            }
            BrowserError::WaitTimeout { what, timeout_ms } => {
                write!(f, "等待 {} 超时 ({}ms)", what, timeout_ms)
            }
            BrowserError::PoolInitFailed { reason } => {
                write!(f, "会话池初始化失败: {}", reason)
            }
        }
    }
}

impl std::error::Error for BrowserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrowserError::LaunchFailed { source }
            | BrowserError::PageCreationFailed { source }
            | BrowserError::NavigationFailed { source, .. }
            | BrowserError::ScriptExecutionFailed { source } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 文件操作错误
#[derive(Debug)]
pub enum FileError {
    /// 文件不存在
    NotFound {
        path: String,
    },
    /// 权限不足
    PermissionDenied {
        path: String,
    },
    /// 读取文件失败
    ReadFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 写入文件失败
    WriteFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// TOML 解析失败
    TomlParseFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::NotFound { path } => write!(f, "文件不存在: {}", path),
            FileError::PermissionDenied { path } => write!(f, "文件权限不足: {}", path),
            FileError::ReadFailed { path, source } => {
                write!(f, "读取文件失败 ({}): {}", path, source)
            }
            FileError::WriteFailed { path, source } => {
                write!(f, "写入文件失败 ({}): {}", path, source)
            }
            FileError::TomlParseFailed { path, source } => {
                write!(f, "TOML解析失败 ({}): {}", path, source)
            }
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileError::ReadFailed { source, .. }
            | FileError::WriteFailed { source, .. }
            | FileError::TomlParseFailed { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 数据解析与校验错误
#[derive(Debug)]
pub enum DataError {
    /// 颜色值解析失败
    ParseFailed {
        value: String,
        reason: String,
    },
    /// 数据校验失败
    ValidationFailed {
        value: String,
        reason: String,
    },
    /// 检查点写入校验不一致（该次保存视为失败）
    VerificationMismatch {
        field: String,
        expected: String,
        actual: String,
    },
    /// JSON 解析失败
    JsonParseFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::ParseFailed { value, reason } => {
                write!(f, "颜色值解析失败 ('{}'): {}", value, reason)
            }
            DataError::ValidationFailed { value, reason } => {
                write!(f, "数据校验失败 ('{}'): {}", value, reason)
            }
            DataError::VerificationMismatch {
                field,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "检查点写入校验不一致 ({}): 期望 {}, 实际 {}",
                    field, expected, actual
                )
            }
            DataError::JsonParseFailed { source } => {
                write!(f, "JSON解析失败: {}", source)
            }
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::JsonParseFailed { source } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置值非法
    InvalidValue {
        name: String,
        value: String,
    },
    /// 必需配置缺失
    MissingValue {
        name: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { name, value } => {
                write!(f, "配置项 {} 的值非法: '{}'", name, value)
            }
            ConfigError::MissingValue { name } => {
                write!(f, "缺少必需配置项: {}", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ========== 从常见错误类型转换 ==========

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        AppError::Browser(BrowserError::ScriptExecutionFailed {
            source: Box::new(err),
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Data(DataError::JsonParseFailed {
            source: Box::new(err),
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::File(FileError::NotFound {
                path: String::new(),
            }),
            std::io::ErrorKind::PermissionDenied => AppError::File(FileError::PermissionDenied {
                path: String::new(),
            }),
            _ => AppError::File(FileError::ReadFailed {
                path: String::new(),
                source: Box::new(err),
            }),
        }
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建导航失败错误
    pub fn navigation_failed(
        url: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Browser(BrowserError::NavigationFailed {
            url: url.into(),
            source: Box::new(source),
        })
    }

    /// 创建元素未找到错误
    pub fn element_not_found(selector: impl Into<String>) -> Self {
        AppError::Browser(BrowserError::ElementNotFound {
            selector: selector.into(),
        })
    }

    /// 创建等待超时错误
    pub fn wait_timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        AppError::Browser(BrowserError::WaitTimeout {
            what: what.into(),
            timeout_ms,
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建检查点校验不一致错误
    pub fn verification_mismatch(
        field: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        AppError::Data(DataError::VerificationMismatch {
            field: field.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
