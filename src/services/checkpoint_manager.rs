//! 检查点管理 - 业务能力层
//!
//! 写入采用"临时文件 + fsync + rename"，进程在写入途中崩溃时
//! 旧检查点保持完整可读。读取失败一律视为没有检查点。

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::CheckpointError;
use crate::models::{Checkpoint, InputIdentity};

/// 任务开始时对已有检查点的处理决定
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    /// 从头开始
    Fresh,
    /// 从未完成的检查点恢复
    Resume(Checkpoint),
    /// 同一输入已经全部处理完，不需要再调度
    AlreadyComplete(Checkpoint),
}

/// 检查点管理器
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
    interval: usize,
    enabled: bool,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, interval: usize) -> Self {
        Self {
            path: path.into(),
            interval,
            enabled: true,
        }
    }

    /// 不读写任何文件的管理器
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            interval: 0,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 已结束（成功或放弃）的批次数量是否到了保存点
    pub fn is_due(&self, terminal: usize) -> bool {
        self.enabled && self.interval > 0 && terminal > 0 && terminal % self.interval == 0
    }

    /// 原子保存检查点
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        let path_str = self.path.display().to_string();
        let json = serde_json::to_vec_pretty(checkpoint).map_err(|source| {
            CheckpointError::JsonFailed {
                path: path_str.clone(),
                source,
            }
        })?;

        let write_failed = |source| CheckpointError::WriteFailed {
            path: path_str.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).await.map_err(write_failed)?;
        file.write_all(&json).await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| CheckpointError::RenameFailed {
                path: path_str.clone(),
                source,
            })?;

        info!(
            "💾 检查点已保存: {} ({}/{} 批次{})",
            path_str,
            checkpoint.completed_batches,
            checkpoint.total_batches,
            if checkpoint.completed { "，已完成" } else { "" }
        );
        Ok(())
    }

    /// 读取检查点；文件不存在或损坏时返回 `None`
    pub async fn load(&self) -> Option<Checkpoint> {
        if !self.enabled {
            return None;
        }
        match self.try_load().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("⚠️ {}，忽略已有检查点", e);
                None
            }
        }
    }

    async fn try_load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path_str = self.path.display().to_string();
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("ℹ️ 未找到检查点文件: {}", path_str);
                return Ok(None);
            }
            Err(source) => {
                return Err(CheckpointError::ReadFailed {
                    path: path_str,
                    source,
                })
            }
        };
        let checkpoint = serde_json::from_slice(&content)
            .map_err(|source| CheckpointError::JsonFailed {
                path: path_str.clone(),
                source,
            })?;
        info!("📂 检查点已加载: {}", path_str);
        Ok(Some(checkpoint))
    }

    /// 决定恢复、重新开始还是直接复用已完成的结果
    pub fn decide(
        loaded: Option<Checkpoint>,
        identity: &InputIdentity,
        rerun_completed: bool,
    ) -> ResumeDecision {
        let Some(checkpoint) = loaded else {
            return ResumeDecision::Fresh;
        };
        if checkpoint.identity.source != identity.source
            || checkpoint.identity.digest != identity.digest
        {
            warn!("⚠️ 输入已变化，忽略检查点并从头开始");
            return ResumeDecision::Fresh;
        }
        if checkpoint.identity.batch_size != identity.batch_size {
            warn!(
                "⚠️ 批次大小已变化 ({} → {})，忽略检查点并从头开始",
                checkpoint.identity.batch_size, identity.batch_size
            );
            return ResumeDecision::Fresh;
        }
        if checkpoint.completed {
            if rerun_completed {
                info!("🔁 检查点显示已完成，按配置重新执行");
                return ResumeDecision::Fresh;
            }
            info!("✅ 同一输入已在之前完成处理");
            return ResumeDecision::AlreadyComplete(checkpoint);
        }
        ResumeDecision::Resume(checkpoint)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
