//! 重试与退避策略
//!
//! 第 k 次尝试（从 1 开始）之前的等待为 `base * 2^(k-1) * jitter`，
//! jitter 在 `[jitter_low, jitter_high]` 内均匀取值，再受 `max_delay` 封顶。

use std::time::Duration;

use rand::Rng;

use crate::error::WorkerErrorKind;

/// 一次失败之后的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 计入尝试次数，退避后重试
    RetryWithBackoff,
    /// 不计入尝试次数，冷却后让准入闸门复查
    RecheckResources,
    /// 放弃该批次
    Abandon,
}

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 每个批次计入次数的尝试上限
    pub attempt_ceiling: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_low: f64,
    pub jitter_high: f64,
    /// 资源不足时的复查上限（每次计数尝试内）
    pub admission_rechecks: u32,
    /// 准入被拒绝后的冷却时间
    pub admission_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_ceiling: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_low: 0.5,
            jitter_high: 1.5,
            admission_rechecks: 3,
            admission_cooldown: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// 不带抖动的退避时间
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// 第 `attempt` 次尝试之前的等待时间
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_high > self.jitter_low {
            rand::thread_rng().gen_range(self.jitter_low..=self.jitter_high)
        } else {
            self.jitter_low
        };
        self.delay_with_jitter(attempt, jitter)
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_finite() { jitter.max(0.0) } else { 1.0 };
        self.nominal_delay(attempt)
            .mul_f64(jitter)
            .min(self.max_delay)
    }

    /// 根据错误类别决定下一步
    ///
    /// `counted` 是此前已计入的尝试次数，`rechecks` 是当前这次尝试
    /// 已用掉的资源复查次数。
    pub fn decide(&self, kind: WorkerErrorKind, counted: u32, rechecks: u32) -> RetryDecision {
        match kind {
            WorkerErrorKind::Fatal => RetryDecision::Abandon,
            WorkerErrorKind::ResourceExhausted if rechecks < self.admission_rechecks => {
                RetryDecision::RecheckResources
            }
            _ if counted + 1 >= self.attempt_ceiling => RetryDecision::Abandon,
            _ => RetryDecision::RetryWithBackoff,
        }
    }
}
