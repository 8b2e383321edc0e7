//! 产出文件

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 成功批次的产出文件
///
/// 每个成功批次恰好对应一个产出文件。内容哈希由校验器延迟计算。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// 所属批次序号
    pub batch_seq: u32,
    pub path: PathBuf,
    /// 字节大小
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl Artifact {
    pub fn new(batch_seq: u32, path: PathBuf, size: u64) -> Self {
        Self {
            batch_seq,
            path,
            size,
            content_hash: None,
        }
    }

    /// 文件名（用于日志）
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}
