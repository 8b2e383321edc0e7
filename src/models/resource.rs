//! 资源采样

use serde::Serialize;

/// 某一时刻的主机资源快照
///
/// 只在内存中短暂存在：由遥测探针产生，立即交给准入闸门消费，从不落盘。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    /// 可用内存（MB）
    pub available_memory_mb: u64,
    /// 内存使用率（%）
    pub memory_percent: f32,
    /// CPU 使用率（%）
    pub cpu_percent: f32,
    /// 剩余磁盘（MB）
    pub free_disk_mb: u64,
    /// 匹配工作进程特征的外部进程数量
    pub process_count: usize,
    /// 采样是否成功；`false` 表示保守的"未知"快照
    pub known: bool,
}

impl ResourceSample {
    /// 采样失败或超时时使用的保守快照：视为资源不可用
    pub fn unknown() -> Self {
        Self {
            available_memory_mb: 0,
            memory_percent: 100.0,
            cpu_percent: 100.0,
            free_disk_mb: 0,
            process_count: 0,
            known: false,
        }
    }
}

impl std::fmt::Display for ResourceSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.known {
            return write!(f, "资源未知");
        }
        write!(
            f,
            "内存 {}MB ({:.1}%), CPU {:.1}%, 磁盘 {}MB, 进程 {}",
            self.available_memory_mb,
            self.memory_percent,
            self.cpu_percent,
            self.free_disk_mb,
            self.process_count
        )
    }
}
