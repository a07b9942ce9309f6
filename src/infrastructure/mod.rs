//! 基础设施层
//!
//! 持有稀缺资源（页面、资源登记表），只暴露能力，不认识业务。

pub mod page_ops;
pub mod resource_registry;

pub use page_ops::PageOps;
pub use resource_registry::{CleanupFn, CleanupOptions, CleanupReport, ResourceRegistry};
