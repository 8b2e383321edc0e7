//! 检查点数据结构

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::models::artifact::Artifact;
use crate::models::job::InputIdentity;

/// 任务进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub job_id: String,
    /// 输入身份，恢复时必须与当前输入一致
    pub identity: InputIdentity,
    pub total_batches: usize,
    /// 已成功的批次数量
    pub completed_batches: usize,
    /// 累计处理的代码数量
    pub processed_count: usize,
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub abandoned_batches: Vec<u32>,
    /// 所有批次是否都已到达终态
    pub completed: bool,
    pub timestamp: DateTime<Local>,
}

impl Checkpoint {
    pub const VERSION: &'static str = "1.0";
}
