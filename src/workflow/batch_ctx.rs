//! 批次处理上下文
//!
//! 封装"我正在处理哪个任务的第几批"这一信息

use std::fmt::Display;

/// 批次处理上下文
#[derive(Debug, Clone)]
pub struct BatchCtx {
    /// 任务 ID
    pub job_id: String,

    /// 批次序号（从1开始）
    pub batch_seq: u32,

    /// 批次总数（仅用于日志显示）
    pub total_batches: usize,
}

impl BatchCtx {
    pub fn new(job_id: impl Into<String>, batch_seq: u32, total_batches: usize) -> Self {
        Self {
            job_id: job_id.into(),
            batch_seq,
            total_batches,
        }
    }
}

impl Display for BatchCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[批次 {}/{}]", self.batch_seq, self.total_batches)
    }
}
