//! 产出文件发布 - 业务能力层
//!
//! 工作进程把文件下载到自己的隔离目录，这里负责给它起一个全局唯一的
//! 名字并移动到共享输出目录。重名时追加 `-1`、`-2` 后缀，既不覆盖也不跳过。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{AppError, AppResult, FileError};
use crate::models::Artifact;

/// 进程内单调递增的命名序号
static NAME_TOKEN: AtomicU64 = AtomicU64::new(1);

/// 下一个唯一序号
pub fn next_token() -> u64 {
    NAME_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// 生成 `{stem}_batch_{seq}_{时间戳}_{序号}.{ext}`
pub fn unique_file_name(original: &Path, batch_seq: u32, token: u64) -> String {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "export".to_string());
    let timestamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
    match original.extension() {
        Some(ext) => format!(
            "{}_batch_{}_{}_{}.{}",
            stem,
            batch_seq,
            timestamp,
            token,
            ext.to_string_lossy()
        ),
        None => format!("{}_batch_{}_{}_{}", stem, batch_seq, timestamp, token),
    }
}

/// 在目标目录中找一个不存在的路径
async fn free_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}-{n}{ext}"));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// 产出文件发布器
#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    output_dir: PathBuf,
}

impl ArtifactPublisher {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// 把工作进程的下载文件移动到输出目录
    pub async fn publish(&self, source: &Path, batch_seq: u32) -> AppResult<Artifact> {
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(FileError::NotFound {
                path: source.display().to_string(),
            }
            .into());
        }
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| AppError::file_write_failed(self.output_dir.display().to_string(), e))?;

        let file_name = unique_file_name(source, batch_seq, next_token());
        let target = free_path(&self.output_dir, &file_name).await;

        move_file(source, &target).await?;

        let size = fs::metadata(&target)
            .await
            .map_err(|e| AppError::file_read_failed(target.display().to_string(), e))?
            .len();

        info!(
            "[批次 {}] 📁 文件已保存: {} ({} 字节)",
            batch_seq,
            target.display(),
            size
        );
        Ok(Artifact::new(batch_seq, target, size))
    }
}

/// rename 失败（跨文件系统）时退回到复制后删除
async fn move_file(from: &Path, to: &Path) -> AppResult<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    debug!("rename 失败，改为复制: {} -> {}", from.display(), to.display());
    let move_failed = |source| {
        AppError::File(FileError::MoveFailed {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        })
    };
    fs::copy(from, to).await.map_err(move_failed)?;
    fs::remove_file(from).await.map_err(move_failed)?;
    Ok(())
}
