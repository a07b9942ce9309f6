//! 编排层（Orchestrator Layer）
//!
//! 流水线主循环与停机协调。

pub mod batch_processor;
pub mod shutdown;

pub use batch_processor::{Pipeline, RunState};
pub use shutdown::ShutdownCoordinator;
