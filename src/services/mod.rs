//! 业务能力层（Services Layer）
//!
//! 每个模块描述一种能力：持久化检查点、写增量快照、出报告。

pub mod checkpoint_store;
pub mod incremental_backup;
pub mod report;

pub use checkpoint_store::CheckpointStore;
pub use incremental_backup::{compute_diff, IncrementalBackupStore, IncrementalSnapshot, StatsDelta};
pub use report::ReportWriter;
