//! 流程层（Workflow Layer）
//!
//! 定义"一个颜色"的完整提取流程；不持有资源，只依赖门面能力。

pub mod color_ctx;
pub mod color_flow;

pub use color_ctx::ColorCtx;
pub use color_flow::ColorFlow;
