//! 遥测探针 - 基础设施层
//!
//! 对主机资源做一次有时限的采样。采样失败或超时都不会向上抛错，
//! 而是返回保守的"未知"快照，由准入闸门按"资源不可用"处理。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ResourceError;
use crate::infrastructure::process_table::ProcessTable;
use crate::models::ResourceSample;

/// 资源探针
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// 采样一次；永远返回一个快照
    async fn sample(&self) -> ResourceSample;
}

/// 读取 /proc 和文件系统统计的探针
pub struct SystemProbe {
    table: Arc<dyn ProcessTable>,
    patterns: Vec<String>,
    disk_path: PathBuf,
    cpu_window: Duration,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(table: Arc<dyn ProcessTable>, patterns: Vec<String>, timeout: Duration) -> Self {
        Self {
            table,
            patterns,
            disk_path: PathBuf::from("."),
            cpu_window: Duration::from_millis(250),
            timeout,
        }
    }

    /// 统计剩余磁盘空间的目录（默认当前目录）
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    fn read_blocking(
        table: &dyn ProcessTable,
        patterns: &[String],
        disk_path: &Path,
        cpu_window: Duration,
    ) -> Result<ResourceSample, ResourceError> {
        let failed = |reason: String| ResourceError::ProbeFailed { reason };

        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| failed(format!("/proc/meminfo: {e}")))?;
        let memory = parse_meminfo(&meminfo)
            .ok_or_else(|| failed("无法解析 /proc/meminfo".to_string()))?;

        let read_cpu = || {
            std::fs::read_to_string("/proc/stat")
                .ok()
                .and_then(|s| parse_cpu_times(&s))
                .ok_or_else(|| failed("无法读取 /proc/stat".to_string()))
        };
        let before = read_cpu()?;
        std::thread::sleep(cpu_window);
        let after = read_cpu()?;

        let disk_path = existing_ancestor(disk_path);
        let free_disk_mb = nix::sys::statvfs::statvfs(disk_path)
            .map(|st| st.blocks_available() as u64 * st.fragment_size() as u64 / 1024 / 1024)
            .map_err(|e| failed(format!("statvfs {}: {e}", disk_path.display())))?;

        let process_count = table
            .list()
            .map_err(|e| failed(e.to_string()))?
            .iter()
            .filter(|p| p.matches_any(patterns))
            .count();

        Ok(ResourceSample {
            available_memory_mb: memory.available_kb / 1024,
            memory_percent: memory.used_percent(),
            cpu_percent: cpu_percent(&before, &after),
            free_disk_mb,
            process_count,
            known: true,
        })
    }
}

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn sample(&self) -> ResourceSample {
        let table = self.table.clone();
        let patterns = self.patterns.clone();
        let disk_path = self.disk_path.clone();
        let cpu_window = self.cpu_window;

        let task = tokio::task::spawn_blocking(move || {
            Self::read_blocking(table.as_ref(), &patterns, &disk_path, cpu_window)
        });

        let err = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(sample))) => {
                debug!("📊 资源采样: {}", sample);
                return sample;
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(join_err)) => ResourceError::ProbeFailed {
                reason: join_err.to_string(),
            },
            Err(_) => ResourceError::ProbeTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
        };
        warn!("⚠️ {}，按资源不可用处理", err);
        ResourceSample::unknown()
    }
}

/// 目录还没创建时，统计最近一个已存在的上级目录所在的文件系统
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."))
}

// ========== 解析 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    pub fn used_percent(&self) -> f32 {
        if self.total_kb == 0 {
            return 100.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        (used as f64 / self.total_kb as f64 * 100.0) as f32
    }
}

pub(crate) fn parse_meminfo(txt: &str) -> Option<MemInfo> {
    let field = |key: &str| -> Option<u64> {
        txt.lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    };
    let total_kb = field("MemTotal:")?;
    // 老内核没有 MemAvailable，退回到 MemFree
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some(MemInfo {
        total_kb,
        available_kb,
    })
}

/// /proc/stat 第一行的累计 CPU 时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

pub(crate) fn parse_cpu_times(txt: &str) -> Option<CpuTimes> {
    let line = txt.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

pub(crate) fn cpu_percent(before: &CpuTimes, after: &CpuTimes) -> f32 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle);
    ((total - idle.min(total)) as f64 / total as f64 * 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::process_table::ProcFsTable;

    const MEMINFO: &str = "MemTotal:        8000000 kB\n\
                           MemFree:          500000 kB\n\
                           MemAvailable:    2000000 kB\n\
                           Buffers:          100000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let mem = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(mem.total_kb, 8_000_000);
        assert_eq!(mem.available_kb, 2_000_000);
        assert!((mem.used_percent() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_parse_meminfo_falls_back_to_memfree() {
        let mem = parse_meminfo("MemTotal: 1000 kB\nMemFree: 250 kB\n").unwrap();
        assert_eq!(mem.available_kb, 250);
    }

    #[test]
    fn test_cpu_percent_between_samples() {
        let before = parse_cpu_times("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        let after = parse_cpu_times("cpu  200 0 200 750 150 0 0 0 0 0\n").unwrap();
        // total +300, idle(+iowait) +100
        let pct = cpu_percent(&before, &after);
        assert!((pct - 66.666).abs() < 0.1, "got {pct}");
    }

    #[test]
    fn test_cpu_percent_without_progress_is_zero() {
        let t = CpuTimes { idle: 10, total: 20 };
        assert_eq!(cpu_percent(&t, &t), 0.0);
    }

    #[test]
    fn test_existing_ancestor_of_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("downloads/nested");
        assert_eq!(existing_ancestor(&missing), dir.path());
        assert_eq!(existing_ancestor(dir.path()), dir.path());
        assert_eq!(existing_ancestor(Path::new("not-created-yet")), Path::new("."));
    }

    #[tokio::test]
    async fn test_sample_with_missing_disk_dir_is_known() {
        let dir = tempfile::tempdir().unwrap();
        let system = SystemProbe::new(
            Arc::new(ProcFsTable::new()),
            vec!["no-such-process-name-xyz".to_string()],
            Duration::from_secs(5),
        )
        .with_cpu_window(Duration::from_millis(20))
        .with_disk_path(dir.path().join("downloads"));

        let sample = system.sample().await;
        assert!(sample.known, "目录未创建时采样不应失败");
        assert!(sample.free_disk_mb > 0);
        assert_eq!(sample.process_count, 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_yields_unknown_sample() {
        let probe = SystemProbe::new(Arc::new(ProcFsTable::new()), vec![], Duration::ZERO)
            .with_cpu_window(Duration::from_millis(200));
        let sample = probe.sample().await;
        assert!(!sample.known);
        assert_eq!(sample.available_memory_mb, 0);
    }
}
