//! 准入闸门 - 业务能力层
//!
//! 根据一次资源采样回答两个问题：现在能不能再启动一个工作进程，
//! 以及当前资源状况下建议的并发数量。闸门本身不采样、不杀进程，
//! 只做纯判断，所以判断结果完全由输入快照决定。

use crate::error::ResourceError;
use crate::models::ResourceSample;

/// 准入阈值
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionThresholds {
    pub min_free_memory_mb: u64,
    pub max_cpu_percent: f32,
    /// 超过后需要先做紧急清理
    pub max_tracked_processes: usize,
    /// 达到后拒绝启动，任务中止
    pub catastrophic_process_count: usize,
    /// 配置的并发上限
    pub concurrency_ceiling: usize,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self {
            min_free_memory_mb: 300,
            max_cpu_percent: 75.0,
            max_tracked_processes: 50,
            catastrophic_process_count: 100,
            concurrency_ceiling: 2,
        }
    }
}

/// 一次准入判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    /// 是否允许再启动一个工作进程
    pub admit: bool,
    /// 建议的并发数量，始终在 `1..=concurrency_ceiling` 之间
    pub recommended: usize,
    /// 外部进程数量超过高水位，应先做紧急清理再重新采样
    pub needs_emergency_sweep: bool,
}

/// 准入闸门
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    thresholds: AdmissionThresholds,
}

impl AdmissionGate {
    pub fn new(thresholds: AdmissionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AdmissionThresholds {
        &self.thresholds
    }

    /// 判断是否允许启动
    ///
    /// 进程数量达到灾难阈值时返回错误，调用方应停止调度；
    /// 采样未知时一律拒绝，建议并发为 1。
    pub fn may_launch(&self, sample: &ResourceSample) -> Result<AdmissionDecision, ResourceError> {
        let t = &self.thresholds;

        if sample.known && sample.process_count >= t.catastrophic_process_count {
            return Err(ResourceError::CatastrophicProcessCount {
                count: sample.process_count,
                limit: t.catastrophic_process_count,
            });
        }

        if !sample.known {
            return Ok(AdmissionDecision {
                admit: false,
                recommended: 1,
                needs_emergency_sweep: false,
            });
        }

        let admit = sample.available_memory_mb >= t.min_free_memory_mb
            && sample.cpu_percent <= t.max_cpu_percent;

        Ok(AdmissionDecision {
            admit,
            recommended: self.recommended_concurrency(sample),
            needs_emergency_sweep: sample.process_count > t.max_tracked_processes,
        })
    }

    /// 按资源余量分档给出建议并发
    ///
    /// - 充裕（内存 ≥ 2×下限 且 CPU ≤ 0.6×上限）：配置上限
    /// - 中等（内存 ≥ 1.5×下限 且 CPU ≤ 0.8×上限）：上限的一半（向上取整）
    /// - 其余：1
    pub fn recommended_concurrency(&self, sample: &ResourceSample) -> usize {
        let t = &self.thresholds;
        let ceiling = t.concurrency_ceiling.max(1);
        if !sample.known {
            return 1;
        }

        let mem = sample.available_memory_mb as f64;
        let min_mem = t.min_free_memory_mb as f64;
        let cpu = sample.cpu_percent;
        let max_cpu = t.max_cpu_percent;

        let recommended = if mem >= 2.0 * min_mem && cpu <= 0.6 * max_cpu {
            ceiling
        } else if mem >= 1.5 * min_mem && cpu <= 0.8 * max_cpu {
            ceiling.div_ceil(2)
        } else {
            1
        };
        recommended.clamp(1, ceiling)
    }
}
