//! # Update Color Hex
//!
//! 一个用于自动补全颜色数据 hex 值的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/page_ops` - 页面操作门面，持有 Page 引用并内置重试
//! - `infrastructure/resource_registry` - 资源登记表，按优先级统一清理
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不关心清单遍历
//! - `CheckpointStore` - 检查点持久化能力（备份 + 回读校验）
//! - `IncrementalBackupStore` - 增量快照能力
//! - `ReportWriter` - 出 Markdown 报告能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个颜色"的完整提取流程
//! - `ColorCtx` - 上下文封装（编号 + 清单位置）
//! - `ColorFlow` - 流程编排（搜索 → 读取 → 归一化）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 流水线主循环，管理会话池和并发
//! - `orchestrator/shutdown` - 停机协调器，信号处理与紧急备份
//!
//! ## 横切模块
//! - `browser/` - 无头浏览器启动与会话池
//! - `models/` - 颜色条目、检查点、统计与清单加载
//! - `recovery` - 错误分类与恢复策略

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod recovery;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::SessionPool;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{PageOps, ResourceRegistry};
pub use models::color::ColorEntry;
pub use orchestrator::{Pipeline, RunState, ShutdownCoordinator};
pub use services::CheckpointStore;
pub use workflow::{ColorCtx, ColorFlow};
