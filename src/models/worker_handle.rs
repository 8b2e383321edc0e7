//! 工作进程句柄与登记表
//!
//! 每次尝试在启动外部进程之前先登记一个 `WorkerHandle`，进程清理器据此
//! 区分"受管进程"和"泄漏进程"。登记与并发上限检查在同一把锁内完成，
//! 保证同时存活的工作进程数量不超过准入闸门最近一次给出的建议值。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// 一个外部工作进程的运行时表示
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub batch_seq: u32,
    pub attempt: u32,
    pub started_at: Instant,
    /// 隔离的工作目录，同时作为进程归属的标记
    pub workspace: PathBuf,
    /// 根进程 PID（清理器扫描时回填）
    pub pid: Option<u32>,
}

impl WorkerHandle {
    pub fn new(batch_seq: u32, attempt: u32, workspace: PathBuf) -> Self {
        Self {
            batch_seq,
            attempt,
            started_at: Instant::now(),
            workspace,
            pid: None,
        }
    }

    /// 出现在进程命令行中的归属标记
    ///
    /// 以路径分隔符结尾，避免 `batch_1` 匹配到 `batch_10` 的进程。
    pub fn marker(&self) -> String {
        let mut marker = self.workspace.to_string_lossy().to_string();
        if !marker.ends_with(std::path::MAIN_SEPARATOR) {
            marker.push(std::path::MAIN_SEPARATOR);
        }
        marker
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// 存活工作进程登记表
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    live: Mutex<BTreeMap<u32, WorkerHandle>>,
    released: Notify,
    peak: Mutex<usize>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在并发上限内登记；超过上限返回 `false`
    pub fn try_register(&self, handle: WorkerHandle, limit: usize) -> bool {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if live.len() >= limit.max(1) {
            return false;
        }
        live.insert(handle.batch_seq, handle);
        let mut peak = self.peak.lock().unwrap_or_else(|e| e.into_inner());
        *peak = (*peak).max(live.len());
        true
    }

    pub fn unregister(&self, batch_seq: u32) -> Option<WorkerHandle> {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&batch_seq);
        self.released.notify_waiters();
        removed
    }

    /// 等待任意一个工作进程注销
    pub async fn released(&self) {
        self.released.notified().await;
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 历史最高同时存活数量
    pub fn peak(&self) -> usize {
        *self.peak.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<WorkerHandle> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn set_pid(&self, batch_seq: u32, pid: u32) {
        if let Some(handle) = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&batch_seq)
        {
            handle.pid.get_or_insert(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_respects_limit() {
        let registry = WorkerRegistry::new();
        assert!(registry.try_register(WorkerHandle::new(1, 1, "/w/1".into()), 2));
        assert!(registry.try_register(WorkerHandle::new(2, 1, "/w/2".into()), 2));
        assert!(!registry.try_register(WorkerHandle::new(3, 1, "/w/3".into()), 2));
        assert_eq!(registry.live_count(), 2);

        registry.unregister(1);
        assert!(registry.try_register(WorkerHandle::new(3, 1, "/w/3".into()), 2));
        assert_eq!(registry.peak(), 2);
    }

    #[test]
    fn test_limit_never_below_one() {
        let registry = WorkerRegistry::new();
        assert!(registry.try_register(WorkerHandle::new(1, 1, "/w/1".into()), 0));
        assert!(!registry.try_register(WorkerHandle::new(2, 1, "/w/2".into()), 0));
    }

    #[test]
    fn test_set_pid_keeps_first_value() {
        let registry = WorkerRegistry::new();
        registry.try_register(WorkerHandle::new(7, 1, "/w/7".into()), 1);
        registry.set_pid(7, 100);
        registry.set_pid(7, 200);
        assert_eq!(registry.snapshot()[0].pid, Some(100));
        assert_eq!(registry.snapshot()[0].marker(), "/w/7/");
    }
}
