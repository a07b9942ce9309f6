/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 颜色数据文件（TOML 清单）
    pub colors_file: String,
    /// 检查点文件
    pub checkpoint_file: String,
    /// 备份目录
    pub backup_dir: String,
    /// Markdown 报告文件
    pub report_file: String,
    /// 色卡搜索页 URL
    pub target_url: String,
    /// 会话池大小
    pub max_sessions: usize,
    /// 单个会话的最大使用次数（达到后退役）
    pub max_usage_per_session: usize,
    /// 并发度（1 = 顺序模式）
    pub concurrency: usize,
    /// 并发模式下每批条目数
    pub batch_size: usize,
    /// 顺序模式下每处理多少条保存一次检查点
    pub save_interval: usize,
    /// 全量/增量备份各自保留的份数
    pub backup_retention: usize,
    /// 搜索后的页面稳定等待时间（毫秒）
    pub settle_delay_ms: u64,
    /// 浏览器可执行文件路径（None 时由 chromiumoxide 自动探测）
    pub browser_executable: Option<String>,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            colors_file: "colors.toml".to_string(),
            checkpoint_file: "color_update_checkpoint.json".to_string(),
            backup_dir: "checkpoint_backups".to_string(),
            report_file: "color_update_report.md".to_string(),
            target_url: "https://www.qtccolor.com/secaiku/".to_string(),
            max_sessions: 3,
            max_usage_per_session: 20,
            concurrency: 1,
            batch_size: 5,
            save_interval: 10,
            backup_retention: 5,
            settle_delay_ms: 1500,
            browser_executable: None,
            verbose_logging: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            colors_file: std::env::var("COLORS_FILE").unwrap_or(default.colors_file),
            checkpoint_file: std::env::var("CHECKPOINT_FILE").unwrap_or(default.checkpoint_file),
            backup_dir: std::env::var("BACKUP_DIR").unwrap_or(default.backup_dir),
            report_file: std::env::var("REPORT_FILE").unwrap_or(default.report_file),
            target_url: std::env::var("TARGET_URL").unwrap_or(default.target_url),
            max_sessions: std::env::var("MAX_SESSIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_sessions),
            max_usage_per_session: std::env::var("MAX_USAGE_PER_SESSION").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_usage_per_session),
            concurrency: std::env::var("CONCURRENCY").ok().and_then(|v| v.parse().ok()).unwrap_or(default.concurrency),
            batch_size: std::env::var("BATCH_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(default.batch_size),
            save_interval: std::env::var("SAVE_INTERVAL").ok().and_then(|v| v.parse().ok()).unwrap_or(default.save_interval),
            backup_retention: std::env::var("BACKUP_RETENTION").ok().and_then(|v| v.parse().ok()).unwrap_or(default.backup_retention),
            settle_delay_ms: std::env::var("SETTLE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.settle_delay_ms),
            browser_executable: std::env::var("BROWSER_EXECUTABLE").ok(),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(default.verbose_logging),
        }
    }
}
