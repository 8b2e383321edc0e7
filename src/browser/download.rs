//! 下载等待
//!
//! 浏览器写文件时先产生临时文件，完成后才改名。这里轮询下载目录，
//! 直到出现一个大小连续两次不变的非临时文件。

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::WorkerError;

const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "tmp", "part"];

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| PARTIAL_SUFFIXES.iter().any(|s| ext.eq_ignore_ascii_case(s)))
}

/// 找出目录里最新的已完成文件及其大小
async fn newest_complete_file(dir: &Path) -> std::io::Result<Option<(PathBuf, u64)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(PathBuf, u64, std::time::SystemTime)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_partial(&path) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(_, _, m)| modified > *m) {
            newest = Some((path, meta.len(), modified));
        }
    }
    Ok(newest.map(|(path, size, _)| (path, size)))
}

/// 等待下载目录里出现完整的文件
///
/// - 超时返回可重试错误
/// - `stop` 触发时立即返回可重试错误
/// - 空文件不算完成
pub async fn wait_for_download(
    dir: &Path,
    timeout: Duration,
    poll: Duration,
    stop: &CancellationToken,
) -> Result<PathBuf, WorkerError> {
    let deadline = Instant::now() + timeout;
    let mut last_seen: Option<(PathBuf, u64)> = None;

    loop {
        match newest_complete_file(dir).await {
            Ok(Some((path, size))) if size > 0 => {
                if last_seen.as_ref() == Some(&(path.clone(), size)) {
                    debug!("下载完成: {} ({} 字节)", path.display(), size);
                    return Ok(path);
                }
                last_seen = Some((path, size));
            }
            Ok(_) => last_seen = None,
            Err(e) => debug!("读取下载目录失败 {}: {}", dir.display(), e),
        }

        if Instant::now() >= deadline {
            return Err(WorkerError::retryable(format!(
                "等待下载超时 ({} 秒)",
                timeout.as_secs()
            )));
        }
        tokio::select! {
            _ = stop.cancelled() => {
                return Err(WorkerError::retryable("收到停止信号，放弃等待下载"));
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
