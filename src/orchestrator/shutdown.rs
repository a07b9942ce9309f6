//! 停机协调器
//!
//! 监听 SIGINT/SIGTERM/SIGHUP，任何一个信号到来即进入统一停机流程：
//! 1. 置位停机标记（编排层见到后停止接受新条目）
//! 2. 用当前内存态写一份紧急备份
//! 3. 按优先级清理资源登记表中的全部资源
//! 4. 依次执行注册的停机回调
//! 5. 记录停机原因并退出进程
//!
//! 同一时刻只允许一次停机流程；后到的信号被忽略。
//! 致命错误走同一条路径，仅退出码不同。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::infrastructure::ResourceRegistry;
use crate::orchestrator::batch_processor::RunState;
use crate::services::CheckpointStore;

/// 停机回调
pub type ShutdownCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// 信号停机的退出码（128 + SIGINT 的惯例值）
const SIGNAL_EXIT_CODE: i32 = 130;
/// 致命错误的退出码
const FATAL_EXIT_CODE: i32 = 1;

/// 停机协调器
pub struct ShutdownCoordinator {
    registry: Arc<ResourceRegistry>,
    store: Arc<CheckpointStore>,
    state: Arc<Mutex<RunState>>,
    shutdown_flag: Arc<AtomicBool>,
    handling: AtomicBool,
    callbacks: Mutex<Vec<ShutdownCallback>>,
}

impl ShutdownCoordinator {
    /// 创建新的停机协调器
    pub fn new(
        registry: Arc<ResourceRegistry>,
        store: Arc<CheckpointStore>,
        state: Arc<Mutex<RunState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            state,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            handling: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// 编排层据此判断是否应停止接受新条目
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    /// 注册一个停机回调（按注册顺序执行）
    pub async fn register_callback(&self, callback: ShutdownCallback) {
        self.callbacks.lock().await.push(callback);
    }

    /// 启动信号监听任务
    ///
    /// 监听任务持有协调器的强引用，存活到进程退出。
    pub fn spawn_signal_listeners(self: &Arc<Self>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let signal_name = wait_for_signal().await;
            coordinator.handle_signal(signal_name).await;
        });
    }

    /// 信号停机流程
    pub async fn handle_signal(&self, signal: &str) {
        if self.handling.swap(true, Ordering::SeqCst) {
            warn!("⚠️ 停机流程已在进行中，忽略信号 {}", signal);
            return;
        }
        warn!("🛑 收到信号 {}, 开始停机流程", signal);
        self.run_shutdown(signal, "收到停机信号").await;
        info!("👋 停机完成 (原因: 信号 {})", signal);
        std::process::exit(SIGNAL_EXIT_CODE);
    }

    /// 致命错误停机流程（校验失败、池彻底不可用等）
    pub async fn handle_fatal(&self, reason: &str) {
        if self.handling.swap(true, Ordering::SeqCst) {
            warn!("⚠️ 停机流程已在进行中，忽略致命错误上报: {}", reason);
            return;
        }
        error!("💥 致命错误: {}, 开始停机流程", reason);
        self.run_shutdown("FATAL", reason).await;
        info!("👋 停机完成 (原因: {})", reason);
        std::process::exit(FATAL_EXIT_CODE);
    }

    async fn run_shutdown(&self, signal: &str, reason: &str) {
        self.shutdown_flag.store(true, Ordering::SeqCst);

        // 紧急备份先行：进度绝不随进程一起丢
        let checkpoint = {
            let state = self.state.lock().await;
            state.to_checkpoint()
        };
        match self.store.write_emergency(&checkpoint, signal, reason).await {
            Ok(path) => info!("🆘 进度已抢救至: {}", path.display()),
            Err(e) => error!("❌ 紧急备份失败: {}", e),
        }

        let report = self.registry.perform_cleanup(signal).await;
        if report.failed_cleanups > 0 {
            warn!(
                "⚠️ {} 个资源未能清理干净 (共 {} 个)",
                report.failed_cleanups, report.total_resources
            );
        }

        let callbacks = self.callbacks.lock().await;
        for callback in callbacks.iter() {
            callback().await;
        }
    }
}

/// 等待首个停机信号，返回信号名
#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("❌ 无法监听 SIGTERM: {}", e);
            return wait_for_ctrl_c().await;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("❌ 无法监听 SIGHUP: {}", e);
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sighup.recv() => "SIGHUP",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ 无法监听 Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::color::ColorEntry;
    use std::sync::atomic::AtomicUsize;

    fn coordinator_in(dir: &std::path::Path) -> (Arc<ShutdownCoordinator>, Arc<Mutex<RunState>>) {
        let config = Config {
            checkpoint_file: dir.join("checkpoint.json").display().to_string(),
            backup_dir: dir.join("backups").display().to_string(),
            ..Config::default()
        };
        let registry = Arc::new(ResourceRegistry::new());
        let store = Arc::new(CheckpointStore::new(&config));
        let state = Arc::new(Mutex::new(RunState::default()));
        (
            ShutdownCoordinator::new(registry, store, state.clone()),
            state,
        )
    }

    #[tokio::test]
    async fn test_shutdown_writes_emergency_backup_and_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, state) = coordinator_in(dir.path());
        {
            let mut guard = state.lock().await;
            guard.cursor = 7;
            guard.colors.push(ColorEntry::new("A01", "朱砂红"));
        }

        let flag = coordinator.shutdown_flag();
        assert!(!flag.load(Ordering::SeqCst));
        coordinator.run_shutdown("SIGTERM", "收到停机信号").await;
        assert!(flag.load(Ordering::SeqCst));

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("emergency_backup_SIGTERM_"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _state) = coordinator_in(dir.path());

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["第一", "第二"] {
            let order = order.clone();
            coordinator
                .register_callback(Box::new(move || {
                    let order = order.clone();
                    Box::pin(async move {
                        order.lock().await.push(label);
                    })
                }))
                .await;
        }

        coordinator.run_shutdown("SIGINT", "收到停机信号").await;
        assert_eq!(*order.lock().await, vec!["第一", "第二"]);
    }

    #[tokio::test]
    async fn test_second_signal_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _state) = coordinator_in(dir.path());

        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            coordinator
                .register_callback(Box::new(move || {
                    let calls = calls.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                    })
                }))
                .await;
        }

        // 第一次占位后，后续流程直接被忽略
        assert!(!coordinator.handling.swap(true, Ordering::SeqCst));
        coordinator.handle_signal("SIGINT").await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
