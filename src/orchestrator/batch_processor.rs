//! 批量颜色处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个流水线的入口，负责清单的遍历/分批与资源调度。
//!
//! ## 核心功能
//!
//! 1. **流水线初始化**：加载检查点、建立会话池、启动健康检查
//! 2. **顺序模式**：逐条借会话提取，按间隔保存检查点
//! 3. **并发模式**：固定批量扇出任务，按原始序号重排后合并，每批保存一次
//! 4. **统计规则**：前后 hex 对比归类成功/失败，编号在两个集合间迁移
//! 5. **失败重试入口**：只对当前失败编号各尝试一次，独立于游标
//!
//! ## 设计特点
//!
//! - **显式依赖注入**：池/登记表/存储全部由构造时传入，无全局单例
//! - **资源借还**：会话无论成败都在本次调用内无条件归还
//! - **向下委托**：单颜色细节委托 workflow::ColorFlow

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::browser::SessionPool;
use crate::config::Config;
use crate::error::{AppError, AppResult, BrowserError};
use crate::infrastructure::{PageOps, ResourceRegistry};
use crate::models::checkpoint::{dedup_colors, now_iso8601, Checkpoint};
use crate::models::color::ColorEntry;
use crate::models::load_color_backlog;
use crate::services::{CheckpointStore, ReportWriter};
use crate::utils::logging;
use crate::workflow::{ColorCtx, ColorFlow};

/// 一次运行的内存态（检查点的在内存镜像）
///
/// 与停机协调器共享：信号到来时据此生成紧急备份。
#[derive(Debug, Default)]
pub struct RunState {
    /// 进度游标（顺序模式：下一个未处理位置；并发模式：本轮已处理数量）
    pub cursor: usize,
    /// 结果集（按编号去重前的工作副本，保持插入顺序）
    pub colors: Vec<ColorEntry>,
    /// 运行统计
    pub stats: crate::models::color::RunStats,
}

impl RunState {
    /// 由检查点恢复内存态
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            cursor: checkpoint.current_index,
            colors: checkpoint.updated_colors,
            stats: checkpoint.stats,
        }
    }

    /// 生成当前内存态的检查点快照
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            current_index: self.cursor,
            updated_colors: dedup_colors(self.colors.clone()),
            stats: self.stats.clone(),
            last_updated: now_iso8601(),
            total_processed: self.stats.updated + self.stats.failed + self.stats.skipped,
            backup_info: None,
        }
    }

    /// 结果集优先、清单兜底地取一个条目的当前值
    pub fn current_value_of<'a>(&'a self, fallback: &'a ColorEntry) -> &'a ColorEntry {
        self.colors
            .iter()
            .find(|c| c.code == fallback.code)
            .unwrap_or(fallback)
    }

    /// 把处理结果应用到内存态：对比前后值归类，并合并进结果集
    pub fn apply_outcome(&mut self, before: &ColorEntry, after: ColorEntry) {
        if after.hex != before.hex {
            self.stats.record_success(&after.code);
        } else {
            self.stats.record_failure(&after.code);
        }
        upsert_color(&mut self.colors, after);
    }
}

/// 按编号合并进结果集：已存在则覆盖原位置，否则追加到末尾
pub(crate) fn upsert_color(colors: &mut Vec<ColorEntry>, entry: ColorEntry) {
    match colors.iter_mut().find(|c| c.code == entry.code) {
        Some(slot) => *slot = entry,
        None => colors.push(entry),
    }
}

/// 顺序模式的恢复窗口：严格从游标处理到清单末尾，绝不回看 `[0, cursor)`
pub(crate) fn resume_window(cursor: usize, total: usize) -> std::ops::Range<usize> {
    cursor.min(total)..total
}

/// 并发模式的对账：挑出尚未成功的条目（带原始清单序号）
pub(crate) fn reconcile_pending(
    backlog: &[ColorEntry],
    successful: &[String],
) -> Vec<(usize, ColorEntry)> {
    backlog
        .iter()
        .enumerate()
        .filter(|(_, entry)| !successful.iter().any(|c| c == &entry.code))
        .map(|(index, entry)| (index, entry.clone()))
        .collect()
}

/// 按原始序号重排一批任务结果，并核对是否与期望顺序一致
///
/// 返回 false 表示重排后仍与期望不符（重复/缺失），调用方记警告即可。
pub(crate) fn sort_and_verify_order(
    outcomes: &mut [(usize, ColorEntry, ColorEntry)],
    expected: &[usize],
) -> bool {
    outcomes.sort_by_key(|(index, _, _)| *index);
    let actual: Vec<usize> = outcomes.iter().map(|(index, _, _)| *index).collect();
    actual == expected
}

/// 颜色补全流水线
pub struct Pipeline {
    config: Config,
    pool: Arc<SessionPool>,
    registry: Arc<ResourceRegistry>,
    store: Arc<CheckpointStore>,
    report: ReportWriter,
    flow: ColorFlow,
    state: Arc<Mutex<RunState>>,
    shutdown_flag: Arc<AtomicBool>,
}

impl Pipeline {
    /// 初始化流水线
    ///
    /// 内存态由调用方构建并与停机协调器共享。
    /// 会话池建不起来是流程级致命错误，直接向上返回。
    pub async fn with_state(
        config: Config,
        registry: Arc<ResourceRegistry>,
        store: Arc<CheckpointStore>,
        state: Arc<Mutex<RunState>>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Result<Self> {
        let pool = SessionPool::initialize(
            config.max_sessions,
            config.max_usage_per_session,
            config.browser_executable.clone(),
            registry.clone(),
        )
        .await?;
        pool.spawn_health_check();

        Ok(Self {
            report: ReportWriter::new(&config.report_file),
            flow: ColorFlow::new(&config),
            config,
            pool,
            registry,
            store,
            state,
            shutdown_flag,
        })
    }

    /// 与停机协调器共享的内存态
    pub fn shared_state(&self) -> Arc<Mutex<RunState>> {
        self.state.clone()
    }

    /// 主入口：恢复并跑完整个清单（先自动补救既往失败）
    pub async fn run_update(&self) -> Result<()> {
        let backlog = load_color_backlog(&self.config.colors_file).await?;
        {
            let mut state = self.state.lock().await;
            state.stats.total = backlog.len();
        }
        logging::log_backlog_loaded(backlog.len(), self.config.concurrency, self.config.batch_size);

        // 先补救既往失败的编号，再推进主清单
        let pending_failed = {
            let state = self.state.lock().await;
            state.stats.failed_identifiers.clone()
        };
        if !pending_failed.is_empty() {
            info!("🔁 先补救 {} 个既往失败的颜色", pending_failed.len());
            self.retry_pass(&backlog, &pending_failed).await?;
        }

        if self.config.concurrency > 1 {
            self.run_concurrent(&backlog).await?;
        } else {
            self.run_sequential(&backlog).await?;
        }

        self.save_and_report(false).await?;
        let stats = { self.state.lock().await.stats.clone() };
        stats.check_consistency();
        logging::print_final_stats(&stats, &self.config.report_file);
        Ok(())
    }

    /// 重试入口：只处理当前失败的编号，各尝试一次，不动游标
    pub async fn run_retry(&self) -> Result<()> {
        let backlog = load_color_backlog(&self.config.colors_file).await?;
        let failed = {
            let state = self.state.lock().await;
            state.stats.failed_identifiers.clone()
        };
        if failed.is_empty() {
            info!("🎉 没有需要重试的颜色");
            return Ok(());
        }
        info!("🔁 重试 {} 个失败的颜色", failed.len());
        self.retry_pass(&backlog, &failed).await?;
        self.save_and_report(false).await?;
        let stats = { self.state.lock().await.stats.clone() };
        logging::print_final_stats(&stats, &self.config.report_file);
        Ok(())
    }

    // ========== 顺序模式 ==========

    async fn run_sequential(&self, backlog: &[ColorEntry]) -> Result<()> {
        let total = backlog.len();
        let start = { self.state.lock().await.cursor };
        let window = resume_window(start, total);
        if window.is_empty() {
            info!("✅ 游标已到清单末尾 ({}/{}), 无需处理", start, total);
            return Ok(());
        }
        info!("▶️ 顺序模式: 从第 {} 条恢复, 共 {} 条", start + 1, total);

        let mut processed_since_save = 0usize;
        for index in window {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                warn!("⛔ 收到停机指令，停止接受新条目");
                break;
            }

            let before = {
                let state = self.state.lock().await;
                state.current_value_of(&backlog[index]).clone()
            };
            let ctx = ColorCtx::new(before.code.clone(), index + 1, total);

            if before.has_valid_hex() {
                info!("{} ⏭️ 已有合法颜色值，跳过", ctx);
                let mut state = self.state.lock().await;
                state.stats.record_skip();
                upsert_color(&mut state.colors, before);
                state.cursor = index + 1;
            } else {
                let after = self.process_entry(&before, &ctx).await?;
                let mut state = self.state.lock().await;
                state.apply_outcome(&before, after);
                state.cursor = index + 1;
            }

            processed_since_save += 1;
            let is_last = index + 1 == total;
            if processed_since_save % self.config.save_interval == 0 || is_last {
                self.save_and_report(!is_last).await?;
            }
        }
        Ok(())
    }

    // ========== 并发模式 ==========

    async fn run_concurrent(&self, backlog: &[ColorEntry]) -> Result<()> {
        let total = backlog.len();
        let pending = {
            let state = self.state.lock().await;
            reconcile_pending(backlog, &state.stats.successful_identifiers)
        };
        info!(
            "▶️ 并发模式: 对账后剩余 {} 条 (共 {} 条, 每批 {})",
            pending.len(),
            total,
            self.config.batch_size
        );
        // 本轮游标重新计数："本轮已处理数量"
        {
            self.state.lock().await.cursor = 0;
        }

        let total_batches = pending.len().div_ceil(self.config.batch_size.max(1));
        for (batch_index, batch) in pending.chunks(self.config.batch_size.max(1)).enumerate() {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                warn!("⛔ 收到停机指令，停止派发后续批次");
                break;
            }
            logging::log_batch_start(batch_index + 1, total_batches, batch.len());

            let fatal = self.run_batch(batch, total).await?;

            {
                let mut state = self.state.lock().await;
                state.cursor += batch.len();
            }
            self.save_and_report(true).await?;
            logging::log_batch_complete(batch_index + 1, batch.len());

            if let Some(e) = fatal {
                if !self.shutdown_flag.load(Ordering::SeqCst) {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// 扇出一个批次：每个条目独立借还会话；
    /// 全部结果（含失败）收齐后按原始序号重排再合并。
    async fn run_batch(
        &self,
        batch: &[(usize, ColorEntry)],
        total: usize,
    ) -> Result<Option<AppError>> {
        let mut tasks = FuturesUnordered::new();
        let mut skipped_outcomes: Vec<(usize, ColorEntry, ColorEntry)> = Vec::new();

        for (index, entry) in batch.iter() {
            let before = {
                let state = self.state.lock().await;
                state.current_value_of(entry).clone()
            };
            let ctx = ColorCtx::new(before.code.clone(), index + 1, total);

            if before.has_valid_hex() {
                info!("{} ⏭️ 已有合法颜色值，跳过", ctx);
                skipped_outcomes.push((*index, before.clone(), before));
                continue;
            }

            let pool = self.pool.clone();
            let flow = self.flow.clone();
            let index = *index;
            let task_before = before.clone();
            let handle = tokio::spawn(async move {
                let session = pool.acquire().await?;
                let ops = PageOps::new(session.page());
                let after = flow.extract(&ops, &task_before, &ctx).await;
                // 无论成败都无条件归还
                pool.release(session).await;
                Ok::<ColorEntry, AppError>(after)
            });
            tasks.push(async move { (index, before, handle.await) });
        }

        // 收集全部结果，失败的任务也不丢弃
        let mut fatal: Option<AppError> = None;
        let mut outcomes: Vec<(usize, ColorEntry, ColorEntry)> = Vec::new();
        while let Some((index, before, joined)) = tasks.next().await {
            match joined {
                Ok(Ok(after)) => outcomes.push((index, before, after)),
                Ok(Err(e)) => {
                    error!("[颜色 {}] ❌ 任务失败: {}", index + 1, e);
                    if matches!(&e, AppError::Browser(BrowserError::PoolInitFailed { .. }))
                        && fatal.is_none()
                    {
                        fatal = Some(e);
                    }
                    outcomes.push((index, before.clone(), before));
                }
                Err(e) => {
                    error!("[颜色 {}] ❌ 任务执行失败: {}", index + 1, e);
                    outcomes.push((index, before.clone(), before));
                }
            }
        }

        // 跳过的条目也按序参与合并与统计
        for (index, _, skipped) in skipped_outcomes {
            outcomes.push((index, skipped.clone(), skipped));
        }

        // 按原始序号重排后合并；顺序对不上只是警告，不致命
        let expected: Vec<usize> = batch.iter().map(|(index, _)| *index).collect();
        let mut sorted_expected = expected.clone();
        sorted_expected.sort_unstable();
        if !sort_and_verify_order(&mut outcomes, &sorted_expected) {
            warn!("⚠️ 本批结果重排后与原始顺序不一致，按现有顺序合并");
        }

        let mut state = self.state.lock().await;
        for (_, before, after) in outcomes {
            if before.has_valid_hex() && before == after {
                state.stats.record_skip();
                upsert_color(&mut state.colors, after);
            } else {
                state.apply_outcome(&before, after);
            }
        }
        Ok(fatal)
    }

    // ========== 共用 ==========

    /// 对失败编号各尝试一次（不触碰游标）
    async fn retry_pass(&self, backlog: &[ColorEntry], failed: &[String]) -> Result<()> {
        for (position, code) in failed.iter().enumerate() {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                warn!("⛔ 收到停机指令，停止重试");
                break;
            }
            let Some(fallback) = backlog.iter().find(|entry| &entry.code == code) else {
                warn!("⚠️ 失败编号 {} 不在当前清单中，跳过", code);
                continue;
            };
            let before = {
                let state = self.state.lock().await;
                state.current_value_of(fallback).clone()
            };
            let ctx = ColorCtx::new(code.clone(), position + 1, failed.len());
            let after = self.process_entry(&before, &ctx).await?;
            let mut state = self.state.lock().await;
            state.apply_outcome(&before, after);
        }
        Ok(())
    }

    /// 处理单个条目：借会话 → 提取 → 无条件归还
    ///
    /// 仅当会话池本身不可用时返回错误（流程级致命）；
    /// 提取层面的失败表现为返回值与输入相同。
    async fn process_entry(&self, entry: &ColorEntry, ctx: &ColorCtx) -> AppResult<ColorEntry> {
        let session = self.pool.acquire().await?;
        let ops = PageOps::new(session.page());
        let after = self.flow.extract(&ops, entry, ctx).await;
        self.pool.release(session).await;
        Ok(after)
    }

    /// 保存检查点并刷新报告（报告失败只记日志）
    async fn save_and_report(&self, in_progress: bool) -> Result<()> {
        let (cursor, colors, stats) = {
            let state = self.state.lock().await;
            (state.cursor, state.colors.clone(), state.stats.clone())
        };
        self.store.save(cursor, &colors, &stats).await?;
        if let Err(e) = self.report.write(&stats, in_progress).await {
            warn!("⚠️ 报告写入失败: {}", e);
        }
        Ok(())
    }

    /// 收尾：优雅关闭会话池并清空资源登记表
    pub async fn finish(&self) {
        self.pool.close_all().await;
        self.registry.perform_cleanup("正常退出").await;
    }

    /// 最后手段：跳过优雅流程，直接杀掉全部会话
    ///
    /// 仅供停机回调使用。
    pub async fn force_shutdown(&self) {
        self.pool.force_close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::color::RunStats;

    fn entry(code: &str, hex: &str) -> ColorEntry {
        ColorEntry {
            code: code.to_string(),
            name: format!("颜色{}", code),
            brand: "测试品牌".to_string(),
            hex: hex.to_string(),
        }
    }

    #[test]
    fn test_two_entry_scenario_statistics() {
        // 清单 [A(空), B(空)]，A 提取到 #112233，B 保持不变
        let mut state = RunState::default();
        state.stats.total = 2;

        let a_before = entry("A", "");
        let mut a_after = a_before.clone();
        a_after.hex = "#112233".to_string();
        state.apply_outcome(&a_before, a_after);

        let b_before = entry("B", "");
        state.apply_outcome(&b_before, b_before.clone());

        assert_eq!(state.stats.updated, 1);
        assert_eq!(state.stats.failed, 1);
        assert_eq!(state.colors.len(), 2);
        assert_eq!(state.colors[0].code, "A");
        assert_eq!(state.colors[0].hex, "#112233");
        assert_eq!(state.colors[1].code, "B");
        assert_eq!(state.colors[1].hex, "");
        assert_eq!(state.stats.successful_identifiers, vec!["A"]);
        assert_eq!(state.stats.failed_identifiers, vec!["B"]);
    }

    #[test]
    fn test_retry_success_moves_identifier() {
        let mut state = RunState::default();
        let before = entry("A", "");
        state.apply_outcome(&before, before.clone());
        assert_eq!(state.stats.failed_identifiers, vec!["A"]);

        // 第二轮成功：编号从失败集合迁入成功集合，结果集原位更新
        let mut after = before.clone();
        after.hex = "#ABCDEF".to_string();
        state.apply_outcome(&before, after);
        assert!(state.stats.failed_identifiers.is_empty());
        assert_eq!(state.stats.successful_identifiers, vec!["A"]);
        assert_eq!(state.colors.len(), 1);
        assert_eq!(state.colors[0].hex, "#ABCDEF");
    }

    #[test]
    fn test_upsert_preserves_insertion_order() {
        let mut colors = vec![entry("A", ""), entry("B", "")];
        upsert_color(&mut colors, entry("A", "#112233"));
        upsert_color(&mut colors, entry("C", ""));
        let codes: Vec<&str> = colors.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["A", "B", "C"]);
        assert_eq!(colors[0].hex, "#112233");
    }

    #[test]
    fn test_resume_window_covers_exactly_remaining_range() {
        assert_eq!(resume_window(0, 5).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(resume_window(3, 7).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        // 游标到头或越界时窗口为空
        assert!(resume_window(5, 5).next().is_none());
        assert!(resume_window(9, 5).next().is_none());
    }

    #[test]
    fn test_sequential_resume_does_not_reprocess_prefix() {
        let backlog: Vec<ColorEntry> = (0..6).map(|i| entry(&format!("C{}", i), "")).collect();
        let mut state = RunState::default();
        state.stats.total = backlog.len();

        // 第一段：从头处理 3 条后中断
        let mut first_pass = Vec::new();
        for index in resume_window(state.cursor, backlog.len()).take(3) {
            let before = state.current_value_of(&backlog[index]).clone();
            let mut after = before.clone();
            after.hex = "#112233".to_string();
            state.apply_outcome(&before, after);
            state.cursor = index + 1;
            first_pass.push(index);
        }
        assert_eq!(first_pass, vec![0, 1, 2]);

        // 模拟重启：经检查点往返后从游标恢复
        let mut state = RunState::from_checkpoint(state.to_checkpoint());
        assert_eq!(state.cursor, 3);

        // 第二段：只处理剩余的 [3, 6)，前缀绝不重做
        let mut second_pass = Vec::new();
        for index in resume_window(state.cursor, backlog.len()) {
            let before = state.current_value_of(&backlog[index]).clone();
            let mut after = before.clone();
            after.hex = "#445566".to_string();
            state.apply_outcome(&before, after);
            state.cursor = index + 1;
            second_pass.push(index);
        }
        assert_eq!(second_pass, vec![3, 4, 5]);

        assert_eq!(state.stats.updated, 6);
        assert_eq!(state.colors.len(), 6);
        // 前缀保持第一段的结果，没有被第二段覆盖
        assert_eq!(state.colors[0].hex, "#112233");
        assert_eq!(state.colors[5].hex, "#445566");
    }

    #[test]
    fn test_reconcile_pending_filters_successful() {
        let backlog = vec![entry("A", ""), entry("B", ""), entry("C", "")];
        let successful = vec!["B".to_string()];
        let pending = reconcile_pending(&backlog, &successful);
        let indices: Vec<usize> = pending.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_order_restored_for_any_arrival_order() {
        // 模拟不同批大小下的乱序到达，重排后必须恢复原始顺序
        for (total, batch_size) in [(7usize, 2usize), (5, 5), (9, 4), (3, 1)] {
            let backlog: Vec<ColorEntry> = (0..total)
                .map(|i| entry(&format!("C{:02}", i), ""))
                .collect();
            for batch_start in (0..total).step_by(batch_size) {
                let batch_end = (batch_start + batch_size).min(total);
                let expected: Vec<usize> = (batch_start..batch_end).collect();

                // 倒序到达
                let mut outcomes: Vec<(usize, ColorEntry, ColorEntry)> = expected
                    .iter()
                    .rev()
                    .map(|&i| (i, backlog[i].clone(), backlog[i].clone()))
                    .collect();
                assert!(sort_and_verify_order(&mut outcomes, &expected));
                let sorted: Vec<usize> = outcomes.iter().map(|(i, _, _)| *i).collect();
                assert_eq!(sorted, expected);
            }
        }
    }

    #[test]
    fn test_order_verification_detects_corruption() {
        let a = entry("A", "");
        // 缺了一个序号：重排也救不回来，核对必须报不一致
        let mut outcomes = vec![(0usize, a.clone(), a.clone()), (2usize, a.clone(), a)];
        assert!(!sort_and_verify_order(&mut outcomes, &[0, 1, 2]));
    }

    #[test]
    fn test_state_checkpoint_roundtrip() {
        let mut state = RunState {
            cursor: 3,
            colors: vec![entry("A", "#112233"), entry("A", "#445566"), entry("B", "")],
            stats: RunStats {
                total: 5,
                updated: 2,
                failed: 1,
                ..Default::default()
            },
        };
        let checkpoint = state.to_checkpoint();
        // 快照时去重：后写的覆盖先写的
        assert_eq!(checkpoint.updated_colors.len(), 2);
        assert_eq!(checkpoint.updated_colors[0].hex, "#445566");
        assert_eq!(checkpoint.total_processed, 3);

        state = RunState::from_checkpoint(checkpoint);
        assert_eq!(state.cursor, 3);
        assert_eq!(state.colors.len(), 2);
    }
}
