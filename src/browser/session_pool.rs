//! 浏览器会话池
//!
//! 维护固定数量的无头浏览器会话：借出/归还、按使用次数懒退役、
//! 定期健康检查并透明补位。会话是昂贵资源，内部的 available/busy
//! 状态只通过 acquire/release 入口串行变更，提取逻辑绝不直接触碰。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, Page};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::browser::headless::launch_headless_browser;
use crate::error::{AppError, AppResult, BrowserError};
use crate::infrastructure::resource_registry::{CleanupOptions, ResourceRegistry};

/// 会话创建的最大尝试次数
const CREATE_ATTEMPTS: usize = 3;
/// 会话创建失败后的固定等待时间
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(2);
/// acquire 轮询的起始退避
const ACQUIRE_BACKOFF_START: Duration = Duration::from_millis(100);
/// acquire 轮询的退避上限
const ACQUIRE_BACKOFF_CAP: Duration = Duration::from_secs(1);
/// 健康检查周期
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// 健康检查单个会话的探活超时
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// 池中的一个浏览器会话
///
/// 所有权始终归会话池；编排层只在借用期间短暂持有，
/// 无论成功失败都必须无条件归还。
pub struct PooledSession {
    id: usize,
    browser: Browser,
    page: Page,
    usage_count: usize,
}

impl PooledSession {
    /// 会话编号
    pub fn id(&self) -> usize {
        self.id
    }

    /// 会话页面
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// 已使用次数
    pub fn usage_count(&self) -> usize {
        self.usage_count
    }

    /// 优雅关闭底层浏览器
    async fn close(mut self) {
        debug!("关闭会话 {} (已使用 {} 次)", self.id, self.usage_count);
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
    }

    /// 直接杀掉底层浏览器进程（仅用于强制关闭路径）
    async fn kill(mut self) {
        debug!("强制终止会话 {}", self.id);
        let _ = self.browser.kill().await;
    }

    /// 探活：向页面发送一个最小求值请求
    async fn check_alive(&self) -> AppResult<()> {
        match timeout(HEALTH_PROBE_TIMEOUT, self.page.evaluate("1 + 1")).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(AppError::Browser(BrowserError::SessionCrashed {
                session_id: self.id,
            })),
        }
    }
}

struct PoolState {
    available: Vec<PooledSession>,
    busy: usize,
    alive: usize,
}

/// 浏览器会话池
pub struct SessionPool {
    max_sessions: usize,
    max_usage_per_session: usize,
    executable: Option<String>,
    registry: Arc<ResourceRegistry>,
    state: Mutex<PoolState>,
    next_id: AtomicUsize,
    closed: AtomicBool,
}

impl SessionPool {
    /// 初始化会话池：预创建全部会话
    ///
    /// 任何一个会话最终无法创建都视为池初始化失败（流程级致命）。
    pub async fn initialize(
        max_sessions: usize,
        max_usage_per_session: usize,
        executable: Option<String>,
        registry: Arc<ResourceRegistry>,
    ) -> AppResult<Arc<Self>> {
        let pool = Arc::new(Self {
            max_sessions,
            max_usage_per_session,
            executable,
            registry,
            state: Mutex::new(PoolState {
                available: Vec::with_capacity(max_sessions),
                busy: 0,
                alive: 0,
            }),
            next_id: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        });

        info!("🏊 初始化会话池 (容量: {})", max_sessions);
        for _ in 0..max_sessions {
            let session = pool.create_session().await.map_err(|e| {
                AppError::Browser(BrowserError::PoolInitFailed {
                    reason: e.to_string(),
                })
            })?;
            let mut state = pool.state.lock().await;
            state.available.push(session);
            state.alive += 1;
        }
        info!("✓ 会话池就绪 ({} 个会话)", max_sessions);

        Ok(pool)
    }

    /// 借出一个会话
    ///
    /// 池空时轮询等待（退避递增）；仅当池已关闭或池中会话
    /// 全部死亡且无法重建时返回错误。
    pub async fn acquire(self: &Arc<Self>) -> AppResult<PooledSession> {
        let mut backoff = ACQUIRE_BACKOFF_START;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AppError::Browser(BrowserError::PoolInitFailed {
                    reason: "会话池已关闭".to_string(),
                }));
            }

            let need_replacement = {
                let mut state = self.state.lock().await;
                if let Some(mut session) = state.available.pop() {
                    state.busy += 1;
                    session.usage_count += 1;
                    debug!(
                        "借出会话 {} (第 {} 次使用, 空闲 {}, 忙碌 {})",
                        session.id,
                        session.usage_count,
                        state.available.len(),
                        state.busy
                    );
                    return Ok(session);
                }
                // 懒退役留下的空位在下一次 acquire 时补齐
                if state.alive < self.max_sessions {
                    state.alive += 1;
                    true
                } else {
                    false
                }
            };

            if need_replacement {
                match self.create_session().await {
                    Ok(mut session) => {
                        let mut state = self.state.lock().await;
                        state.busy += 1;
                        session.usage_count += 1;
                        debug!("借出新建会话 {}", session.id);
                        return Ok(session);
                    }
                    Err(e) => {
                        let pool_dead = {
                            let mut state = self.state.lock().await;
                            state.alive -= 1;
                            state.alive == 0 && state.busy == 0
                        };
                        if pool_dead {
                            return Err(AppError::Browser(BrowserError::PoolInitFailed {
                                reason: format!("无法重建任何会话: {}", e),
                            }));
                        }
                        warn!("⚠️ 补位会话创建失败，继续等待归还: {}", e);
                    }
                }
            }

            sleep(backoff).await;
            backoff = (backoff * 2).min(ACQUIRE_BACKOFF_CAP);
        }
    }

    /// 归还一个会话
    ///
    /// 使用次数达到上限的会话不回池，直接关闭（懒退役）；
    /// 归还前先探活，提取途中崩溃的会话同样退役而不是再借出去。
    /// 两种情况空出的名额都由下一次 acquire 补齐。
    pub async fn release(&self, session: PooledSession) {
        let retire = session.usage_count >= self.max_usage_per_session;
        let closing = self.closed.load(Ordering::SeqCst);

        if retire || closing {
            {
                let mut state = self.state.lock().await;
                state.busy = state.busy.saturating_sub(1);
                state.alive -= 1;
            }
            if retire {
                info!(
                    "♻️ 会话 {} 达到使用上限 ({}), 懒退役",
                    session.id, self.max_usage_per_session
                );
            }
            self.registry
                .unregister(&session_resource_id(session.id))
                .await;
            session.close().await;
            return;
        }

        // 探活失败的会话绝不回池，否则会被反复借出直到下一轮健康检查
        if let Err(e) = session.check_alive().await {
            warn!("⚠️ 归还时发现{}，直接退役", e);
            {
                let mut state = self.state.lock().await;
                state.busy = state.busy.saturating_sub(1);
                state.alive -= 1;
            }
            self.registry
                .unregister(&session_resource_id(session.id))
                .await;
            session.kill().await;
            return;
        }

        let mut state = self.state.lock().await;
        state.busy = state.busy.saturating_sub(1);
        debug!("归还会话 {} (空闲 {})", session.id, state.available.len() + 1);
        state.available.push(session);
    }

    /// 创建一个新会话（有限次重试 + 固定延迟），
    /// 成功后立即以高优先级登记到资源登记表。
    async fn create_session(self: &Arc<Self>) -> AppResult<PooledSession> {
        let mut last_error = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            match launch_headless_browser(self.executable.as_deref()).await {
                Ok((browser, page)) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let session = PooledSession {
                        id,
                        browser,
                        page,
                        usage_count: 0,
                    };
                    self.register_session(id).await;
                    info!("✓ 会话 {} 创建成功", id);
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        "⚠️ 会话创建失败 (第 {}/{} 次): {}",
                        attempt, CREATE_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    if attempt < CREATE_ATTEMPTS {
                        sleep(CREATE_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(AppError::Browser(BrowserError::LaunchFailed {
            source: last_error
                .map(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                .unwrap_or_else(|| "未知原因".to_string().into()),
        }))
    }

    async fn register_session(self: &Arc<Self>, id: usize) {
        let weak = Arc::downgrade(self);
        self.registry
            .register(
                session_resource_id(id),
                "browser_session",
                CleanupOptions {
                    priority: 100,
                    timeout: Duration::from_secs(10),
                    retry_count: 1,
                },
                Box::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(pool) = weak.upgrade() {
                            pool.force_close_session(id).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;
    }

    /// 强制关闭某个空闲会话（清理路径使用；忙碌中的会话不处理）
    async fn force_close_session(&self, id: usize) {
        let session = {
            let mut state = self.state.lock().await;
            match state.available.iter().position(|s| s.id == id) {
                Some(pos) => {
                    state.alive -= 1;
                    Some(state.available.remove(pos))
                }
                None => None,
            }
        };
        match session {
            Some(session) => session.kill().await,
            None => debug!("会话 {} 不在空闲队列（可能正在使用），跳过强制关闭", id),
        }
    }

    /// 启动周期健康检查任务
    ///
    /// 对每个空闲会话探活；死亡会话被驱逐并立即补位，
    /// 保证池的可见容量不因外部崩溃而缩水。
    pub fn spawn_health_check(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            interval.tick().await; // 第一个 tick 立即返回，跳过
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.run_health_check().await;
            }
        })
    }

    async fn run_health_check(self: &Arc<Self>) {
        let idle: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.available)
        };
        if idle.is_empty() {
            return;
        }

        debug!("🩺 健康检查: {} 个空闲会话", idle.len());
        let mut healthy = Vec::with_capacity(idle.len());
        let mut evicted = 0usize;
        for session in idle {
            match session.check_alive().await {
                Ok(()) => healthy.push(session),
                Err(e) => {
                    warn!("⚠️ {}，驱逐并补位", e);
                    self.registry
                        .unregister(&session_resource_id(session.id))
                        .await;
                    {
                        let mut state = self.state.lock().await;
                        state.alive -= 1;
                    }
                    session.kill().await;
                    evicted += 1;
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            state.available.extend(healthy);
        }

        for _ in 0..evicted {
            let reserved = {
                let mut state = self.state.lock().await;
                if state.alive < self.max_sessions {
                    state.alive += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            match self.create_session().await {
                Ok(session) => {
                    let mut state = self.state.lock().await;
                    state.available.push(session);
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    state.alive -= 1;
                    warn!("⚠️ 健康检查补位失败: {}", e);
                    break;
                }
            }
        }

        if evicted > 0 {
            info!(
                "🩺 健康检查完成: 驱逐并补位 {} 个会话 (当前存活 {})",
                evicted,
                self.alive_count().await
            );
        }
    }

    /// 优雅关闭全部会话
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let idle: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.available)
        };
        info!("🔒 关闭会话池 ({} 个空闲会话)", idle.len());
        for session in idle {
            {
                let mut state = self.state.lock().await;
                state.alive -= 1;
            }
            self.registry
                .unregister(&session_resource_id(session.id))
                .await;
            session.close().await;
        }

        // 等待在借会话自然归还（归还路径见到 closed 标记后会直接关闭）
        for _ in 0..100 {
            if self.state.lock().await.busy == 0 {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
        let busy = self.state.lock().await.busy;
        if busy > 0 {
            warn!("⚠️ 仍有 {} 个会话未归还，放弃等待", busy);
        }
    }

    /// 强制关闭全部会话（跳过优雅流程，直接杀进程）
    ///
    /// 仅供停机协调器作为最后手段调用。
    pub async fn force_close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let idle: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.available)
        };
        warn!("⛔ 强制关闭会话池 ({} 个空闲会话)", idle.len());
        for session in idle {
            {
                let mut state = self.state.lock().await;
                state.alive -= 1;
            }
            self.registry
                .unregister(&session_resource_id(session.id))
                .await;
            session.kill().await;
        }
        let busy = self.state.lock().await.busy;
        if busy > 0 {
            warn!("⚠️ {} 个借出中的会话将随进程退出一并终止", busy);
        }
    }

    /// 当前空闲会话数（测试与日志用）
    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.available.len()
    }

    /// 当前存活会话数（含借出中的）
    pub async fn alive_count(&self) -> usize {
        self.state.lock().await.alive
    }
}

fn session_resource_id(id: usize) -> String {
    format!("session-{}", id)
}
