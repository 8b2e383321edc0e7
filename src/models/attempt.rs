//! 单次尝试记录

use std::path::PathBuf;
use std::time::Duration;

/// 一次尝试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 成功产出文件
    Artifact(PathBuf),
    /// 可重试错误
    RetryableError(String),
    /// 致命错误
    FatalError(String),
}

/// 工作进程对某个批次的一次尝试
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 尝试序号（从 1 开始）
    pub index: u32,
    /// 启动前实际等待的退避时间
    pub start_delay: Duration,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

impl Attempt {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Artifact(_))
    }
}
