//! 颜色处理上下文
//!
//! 封装"我正在处理清单里的第几个颜色"这一信息

use std::fmt::Display;

/// 颜色处理上下文
#[derive(Debug, Clone)]
pub struct ColorCtx {
    /// 颜色编号
    pub code: String,

    /// 在清单中的序号（从1开始，仅用于日志显示）
    pub index: usize,

    /// 清单总数
    pub total: usize,
}

impl ColorCtx {
    /// 创建新的颜色上下文
    pub fn new(code: String, index: usize, total: usize) -> Self {
        Self { code, index, total }
    }
}

impl Display for ColorCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[颜色 {}/{} #{}]", self.index, self.total, self.code)
    }
}
