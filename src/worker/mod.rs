//! 工作进程契约
//!
//! 编排层只通过 `Worker` 认识外部工作进程：给它一批代码和一个隔离的
//! 工作目录，它返回下载好的文件路径，或者一个已分类的错误。页面交互的
//! 所有细节（选择器、点击策略、内部回退）都留在实现内部。

pub mod browser_worker;
pub mod normalize;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;

pub use browser_worker::{BrowserWorker, BrowserWorkerSettings};
pub use normalize::{normalize_batch, normalize_code};

/// 外部工作进程
#[async_trait]
pub trait Worker: Send + Sync {
    /// 处理一个批次，返回工作目录内的产出文件路径
    ///
    /// `stop` 触发后实现应尽快结束轮询并返回错误。
    async fn run_batch(
        &self,
        codes: &[String],
        workspace: &Workspace,
        stop: &CancellationToken,
    ) -> Result<PathBuf, WorkerError>;
}

/// 一次尝试独占的工作目录
///
/// 目录路径同时出现在浏览器的命令行里，清理器用它把系统进程归属到句柄。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    /// 浏览器用户数据目录
    pub profile_dir: PathBuf,
    /// 下载目录
    pub output_dir: PathBuf,
}

impl Workspace {
    /// `work_dir/batch_{seq}_attempt_{k}_{token}/`
    pub fn for_attempt(work_dir: &Path, batch_seq: u32, attempt: u32, token: u64) -> Self {
        let root = work_dir.join(format!("batch_{batch_seq}_attempt_{attempt}_{token}"));
        Self::at(root)
    }

    pub fn at(root: PathBuf) -> Self {
        Self {
            profile_dir: root.join("profile"),
            output_dir: root.join("downloads"),
            root,
        }
    }

    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.profile_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await
    }

    /// 删除整个工作目录；失败只记录
    pub async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("删除工作目录失败 {}: {}", self.root.display(), e);
            }
        }
    }
}
