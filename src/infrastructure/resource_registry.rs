//! 资源登记表 - 基础设施层
//!
//! 登记所有需要在退出/信号时释放的资源（会话、池、句柄），
//! 并按优先级从高到低执行一轮清理。每个清理动作带有独立的
//! 超时与重试上限；单个资源清理失败只计数，不会中断整轮清理。

use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 清理动作（异步闭包，可重复调用）
pub type CleanupFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// 单个资源的清理参数
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// 优先级（越大越先清理）
    pub priority: i32,
    /// 单次清理的超时时间
    pub timeout: Duration,
    /// 最大尝试次数
    pub retry_count: usize,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout: Duration::from_secs(5),
            retry_count: 1,
        }
    }
}

struct Registered {
    id: String,
    kind: String,
    options: CleanupOptions,
    cleanup: CleanupFn,
}

/// 一轮清理的结构化统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// 登记的资源总数
    pub total_resources: usize,
    /// 清理成功数
    pub cleaned_resources: usize,
    /// 清理失败数
    pub failed_cleanups: usize,
    /// 整轮耗时（毫秒）
    pub elapsed_ms: u128,
}

/// 资源登记表
pub struct ResourceRegistry {
    resources: Mutex<Vec<Registered>>,
}

impl ResourceRegistry {
    /// 创建新的资源登记表
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
        }
    }

    /// 登记一个资源及其清理动作
    pub async fn register(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        options: CleanupOptions,
        cleanup: CleanupFn,
    ) {
        let id = id.into();
        let kind = kind.into();
        debug!("登记资源: {} (类型: {}, 优先级: {})", id, kind, options.priority);
        let mut resources = self.resources.lock().await;
        // 同名资源覆盖旧登记
        resources.retain(|r| r.id != id);
        resources.push(Registered {
            id,
            kind,
            options,
            cleanup,
        });
    }

    /// 注销一个资源（不执行清理动作）
    pub async fn unregister(&self, id: &str) {
        let mut resources = self.resources.lock().await;
        let before = resources.len();
        resources.retain(|r| r.id != id);
        if resources.len() < before {
            debug!("注销资源: {}", id);
        }
    }

    /// 当前登记的资源数量
    pub async fn len(&self) -> usize {
        self.resources.lock().await.len()
    }

    /// 是否没有任何登记资源
    pub async fn is_empty(&self) -> bool {
        self.resources.lock().await.is_empty()
    }

    /// 执行一轮清理
    ///
    /// 资源按优先级从高到低依次清理；每个清理动作受
    /// `timeout` 与 `retry_count` 约束。失败只计数，
    /// 每个登记的资源都保证得到一次清理机会。
    pub async fn perform_cleanup(&self, trigger: &str) -> CleanupReport {
        let start = Instant::now();
        let mut resources: Vec<Registered> = {
            let mut guard = self.resources.lock().await;
            guard.drain(..).collect()
        };
        resources.sort_by(|a, b| b.options.priority.cmp(&a.options.priority));

        info!("🧹 开始清理资源 (触发原因: {}, 共 {} 个)", trigger, resources.len());

        let total_resources = resources.len();
        let mut cleaned_resources = 0usize;
        let mut failed_cleanups = 0usize;

        for resource in &resources {
            let attempts = resource.options.retry_count.max(1);
            let mut cleaned = false;

            for attempt in 1..=attempts {
                match tokio::time::timeout(resource.options.timeout, (resource.cleanup)()).await {
                    Ok(Ok(())) => {
                        debug!("✓ 资源清理成功: {} ({})", resource.id, resource.kind);
                        cleaned = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(
                            "⚠️ 资源清理失败: {} (第 {}/{} 次): {}",
                            resource.id, attempt, attempts, e
                        );
                    }
                    Err(_) => {
                        warn!(
                            "⚠️ 资源清理超时: {} (第 {}/{} 次, 限时 {:?})",
                            resource.id, attempt, attempts, resource.options.timeout
                        );
                    }
                }
            }

            if cleaned {
                cleaned_resources += 1;
            } else {
                failed_cleanups += 1;
            }
        }

        let report = CleanupReport {
            total_resources,
            cleaned_resources,
            failed_cleanups,
            elapsed_ms: start.elapsed().as_millis(),
        };

        info!(
            "🧹 清理完成: 总数 {}, 成功 {}, 失败 {}, 耗时 {}ms",
            report.total_resources,
            report.cleaned_resources,
            report.failed_cleanups,
            report.elapsed_ms
        );

        report
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_cleanup(counter: Arc<AtomicUsize>) -> CleanupFn {
        Box::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_cleanup_runs_every_resource() {
        let registry = ResourceRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            registry
                .register(
                    format!("res-{}", i),
                    "test",
                    CleanupOptions::default(),
                    counting_cleanup(counter.clone()),
                )
                .await;
        }

        let report = registry.perform_cleanup("test").await;
        assert_eq!(report.total_resources, 3);
        assert_eq!(report.cleaned_resources, 3);
        assert_eq!(report.failed_cleanups, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_order_follows_priority() {
        let registry = ResourceRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, priority) in [("low", 1), ("high", 100), ("mid", 50)] {
            let order = order.clone();
            registry
                .register(
                    id,
                    "test",
                    CleanupOptions {
                        priority,
                        ..Default::default()
                    },
                    Box::new(move || {
                        let order = order.clone();
                        let id = id.to_string();
                        Box::pin(async move {
                            order.lock().await.push(id);
                            Ok(())
                        })
                    }),
                )
                .await;
        }

        registry.perform_cleanup("test").await;
        assert_eq!(*order.lock().await, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_failed_cleanup_does_not_abort_pass() {
        let registry = ResourceRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry
            .register(
                "bad",
                "test",
                CleanupOptions {
                    priority: 100,
                    retry_count: 2,
                    ..Default::default()
                },
                Box::new(|| Box::pin(async { anyhow::bail!("总是失败") })),
            )
            .await;
        registry
            .register(
                "good",
                "test",
                CleanupOptions::default(),
                counting_cleanup(counter.clone()),
            )
            .await;

        let report = registry.perform_cleanup("test").await;
        assert_eq!(report.total_resources, 2);
        assert_eq!(report.cleaned_resources, 1);
        assert_eq!(report.failed_cleanups, 1);
        // 失败的资源不会阻止后面的资源被清理
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_timeout_counts_as_failure() {
        let registry = ResourceRegistry::new();
        registry
            .register(
                "slow",
                "test",
                CleanupOptions {
                    timeout: Duration::from_millis(20),
                    retry_count: 1,
                    ..Default::default()
                },
                Box::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let report = registry.perform_cleanup("test").await;
        assert_eq!(report.failed_cleanups, 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_resource() {
        let registry = ResourceRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register("gone", "test", CleanupOptions::default(), counting_cleanup(counter.clone()))
            .await;
        registry.unregister("gone").await;

        let report = registry.perform_cleanup("test").await;
        assert_eq!(report.total_resources, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
