//! 批次处理流程 - 流程层
//!
//! 核心职责：定义"一个批次"从准入到产出的完整流程
//!
//! 每次尝试的顺序：
//! 1. 退避等待（第一次尝试除外）
//! 2. 启动前清理 → 资源采样 → 准入判断（必要时紧急清理后重新采样）
//! 3. 登记句柄 → 启动节流 → 运行工作进程（有墙钟上限）
//! 4. 终止该句柄的残留进程 → 发布产出文件 → 删除工作目录 → 注销句柄
//!
//! 资源不足引起的复查不计入尝试次数；进程数量达到灾难阈值时直接返回错误。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ResourceError, WorkerError, WorkerErrorKind};
use crate::infrastructure::ResourceProbe;
use crate::models::{Artifact, Attempt, AttemptOutcome, Batch, WorkerHandle, WorkerRegistry};
use crate::services::artifact_publisher::next_token;
use crate::services::{AdmissionGate, ArtifactPublisher, ProcessReaper, SweepKind};
use crate::worker::{Worker, Workspace};
use crate::workflow::batch_ctx::BatchCtx;
use crate::workflow::launch_pacer::LaunchPacer;
use crate::workflow::retry_policy::{RetryDecision, RetryPolicy};

/// 批次的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeeded(Artifact),
    /// 致命错误或重试耗尽
    Abandoned(String),
    /// 收到停止信号，批次未完成，恢复时重新执行
    Interrupted(String),
}

/// 一个批次的处理报告
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub seq: u32,
    pub outcome: BatchOutcome,
    /// 计入次数的尝试
    pub attempts: Vec<Attempt>,
    /// 资源复查次数（不计入尝试）
    pub resource_rechecks: u32,
}

/// 准入结果
enum Admission {
    Granted(WorkerHandle, Workspace),
    /// 复查次数用完仍然资源不足
    Denied(String),
    Cancelled,
}

/// 批次处理流程
///
/// - 编排单个批次的准入、启动、重试和清理
/// - 不知道其他批次的存在，只通过登记表和清理器共享进程资源
pub struct BatchFlow {
    worker: Arc<dyn Worker>,
    probe: Arc<dyn ResourceProbe>,
    gate: AdmissionGate,
    reaper: Arc<ProcessReaper>,
    registry: Arc<WorkerRegistry>,
    publisher: ArtifactPublisher,
    pacer: LaunchPacer,
    policy: RetryPolicy,
    work_dir: PathBuf,
    worker_timeout: Duration,
    cancel: CancellationToken,
}

impl BatchFlow {
    pub fn new(
        config: &Config,
        worker: Arc<dyn Worker>,
        probe: Arc<dyn ResourceProbe>,
        reaper: Arc<ProcessReaper>,
        registry: Arc<WorkerRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            probe,
            gate: AdmissionGate::new(config.thresholds()),
            reaper,
            registry,
            publisher: ArtifactPublisher::new(&config.output_dir),
            pacer: LaunchPacer::new(config.worker_start_delay()),
            policy: config.retry_policy(),
            work_dir: config.work_dir.clone(),
            worker_timeout: config.worker_timeout(),
            cancel,
        }
    }

    /// 处理一个批次直到终态或被中断
    ///
    /// 只有进程数量达到灾难阈值时返回错误。
    pub async fn run(&self, batch: &Batch, ctx: &BatchCtx) -> Result<BatchReport, ResourceError> {
        let mut report = BatchReport {
            seq: batch.seq,
            outcome: BatchOutcome::Interrupted(String::new()),
            attempts: Vec::new(),
            resource_rechecks: 0,
        };
        let mut counted: u32 = 0;
        let mut rechecks: u32 = 0;
        let mut backoff = Duration::ZERO;

        loop {
            if self.cancel.is_cancelled() {
                report.outcome = BatchOutcome::Interrupted("收到停止信号".to_string());
                return Ok(report);
            }
            let attempt_index = counted + 1;

            if !backoff.is_zero() {
                info!(
                    batch = ctx.batch_seq,
                    attempt = attempt_index,
                    "{} ⏳ 等待 {:.1}s 后重试",
                    ctx,
                    backoff.as_secs_f64()
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => continue,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            let start_delay = backoff;
            backoff = Duration::ZERO;

            let (handle, workspace) = match self.admit(ctx, attempt_index, &mut rechecks).await? {
                Admission::Granted(handle, workspace) => (handle, workspace),
                Admission::Cancelled => continue,
                Admission::Denied(reason) => {
                    report.resource_rechecks += rechecks;
                    rechecks = 0;
                    counted += 1;
                    warn!("{} ⚠️ {}，计为一次失败尝试 ({}/{})", ctx, reason, counted, self.policy.attempt_ceiling);
                    report.attempts.push(Attempt {
                        index: counted,
                        start_delay,
                        outcome: AttemptOutcome::RetryableError(reason.clone()),
                        elapsed: Duration::ZERO,
                    });
                    if counted >= self.policy.attempt_ceiling {
                        report.outcome = BatchOutcome::Abandoned(reason);
                        return Ok(report);
                    }
                    backoff = self.policy.delay_before(counted + 1);
                    continue;
                }
            };

            let started = Instant::now();
            let result = self.launch(batch, ctx, &handle, &workspace).await;
            let elapsed = started.elapsed();

            let err = match result {
                Ok(artifact) => {
                    counted += 1;
                    info!(
                        batch = ctx.batch_seq,
                        attempt = counted,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "{} ✅ 批次完成: {}",
                        ctx,
                        artifact.file_name()
                    );
                    report.attempts.push(Attempt {
                        index: counted,
                        start_delay,
                        outcome: AttemptOutcome::Artifact(artifact.path.clone()),
                        elapsed,
                    });
                    report.resource_rechecks += rechecks;
                    report.outcome = BatchOutcome::Succeeded(artifact);
                    return Ok(report);
                }
                Err(err) => err,
            };

            if self.cancel.is_cancelled() {
                report.resource_rechecks += rechecks;
                report.outcome = BatchOutcome::Interrupted(err.to_string());
                return Ok(report);
            }

            match self.policy.decide(err.kind, counted, rechecks) {
                RetryDecision::RecheckResources => {
                    rechecks += 1;
                    warn!(
                        "{} ⚠️ 工作进程启动时资源不足，冷却后复查 ({}/{}): {}",
                        ctx, rechecks, self.policy.admission_rechecks, err.message
                    );
                    if !self.cooldown().await {
                        continue;
                    }
                }
                RetryDecision::RetryWithBackoff => {
                    counted += 1;
                    report.resource_rechecks += rechecks;
                    rechecks = 0;
                    warn!(
                        batch = ctx.batch_seq,
                        attempt = counted,
                        "{} ⚠️ 第 {}/{} 次尝试失败: {}",
                        ctx,
                        counted,
                        self.policy.attempt_ceiling,
                        err
                    );
                    report.attempts.push(Self::failed_attempt(counted, start_delay, &err, elapsed));
                    backoff = self.policy.delay_before(counted + 1);
                }
                RetryDecision::Abandon => {
                    counted += 1;
                    report.resource_rechecks += rechecks;
                    error!(
                        batch = ctx.batch_seq,
                        attempt = counted,
                        "{} ❌ 放弃批次: {}",
                        ctx,
                        err
                    );
                    report.attempts.push(Self::failed_attempt(counted, start_delay, &err, elapsed));
                    report.outcome = BatchOutcome::Abandoned(err.to_string());
                    return Ok(report);
                }
            }
        }
    }

    fn failed_attempt(index: u32, start_delay: Duration, err: &WorkerError, elapsed: Duration) -> Attempt {
        let outcome = match err.kind {
            WorkerErrorKind::Fatal => AttemptOutcome::FatalError(err.message.clone()),
            _ => AttemptOutcome::RetryableError(err.message.clone()),
        };
        Attempt {
            index,
            start_delay,
            outcome,
            elapsed,
        }
    }

    /// 等待一个冷却周期；收到停止信号返回 `false`
    async fn cooldown(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.policy.admission_cooldown) => true,
        }
    }

    /// 准入循环：清理、采样、判断，直到获准、复查用完或收到停止信号
    async fn admit(
        &self,
        ctx: &BatchCtx,
        attempt: u32,
        rechecks: &mut u32,
    ) -> Result<Admission, ResourceError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Admission::Cancelled);
            }

            self.reaper.sweep(SweepKind::PreLaunch).await;
            let mut sample = self.probe.sample().await;
            let mut decision = self.gate.may_launch(&sample)?;

            if decision.needs_emergency_sweep {
                warn!(
                    "{} 🚨 外部进程数量 {} 超过上限 {}，执行紧急清理",
                    ctx,
                    sample.process_count,
                    self.gate.thresholds().max_tracked_processes
                );
                self.reaper.sweep(SweepKind::Emergency).await;
                sample = self.probe.sample().await;
                decision = self.gate.may_launch(&sample)?;
            }

            if decision.admit {
                let workspace = Workspace::for_attempt(&self.work_dir, ctx.batch_seq, attempt, next_token());
                let handle = WorkerHandle::new(ctx.batch_seq, attempt, workspace.root.clone());
                if self.registry.try_register(handle.clone(), decision.recommended) {
                    return Ok(Admission::Granted(handle, workspace));
                }
                // 资源允许，但存活数量已达到当前建议并发：等别人释放
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(Admission::Cancelled),
                    _ = self.registry.released() => {}
                    _ = tokio::time::sleep(self.policy.admission_cooldown) => {}
                }
                continue;
            }

            if *rechecks >= self.policy.admission_rechecks {
                return Ok(Admission::Denied(format!("资源不足 ({sample})")));
            }
            *rechecks += 1;
            info!(
                "{} ⏳ 资源不足 ({})，{:.1}s 后复查 ({}/{})",
                ctx,
                sample,
                self.policy.admission_cooldown.as_secs_f64(),
                rechecks,
                self.policy.admission_rechecks
            );
            if !self.cooldown().await {
                return Ok(Admission::Cancelled);
            }
        }
    }

    /// 运行一次工作进程并在结束后清理
    async fn launch(
        &self,
        batch: &Batch,
        ctx: &BatchCtx,
        handle: &WorkerHandle,
        workspace: &Workspace,
    ) -> Result<Artifact, WorkerError> {
        let result = self.run_worker(batch, ctx, handle, workspace).await;

        self.reaper.terminate_handle(handle).await;
        let result = match result {
            Ok(path) => self
                .publisher
                .publish(&path, batch.seq)
                .await
                .map_err(|e| WorkerError::retryable(format!("发布产出文件失败: {e}"))),
            Err(e) => Err(e),
        };
        workspace.remove().await;
        self.registry.unregister(batch.seq);
        result
    }

    async fn run_worker(
        &self,
        batch: &Batch,
        ctx: &BatchCtx,
        handle: &WorkerHandle,
        workspace: &Workspace,
    ) -> Result<PathBuf, WorkerError> {
        self.pacer.wait_turn().await;
        workspace
            .create()
            .await
            .map_err(|e| WorkerError::classify(format!("创建工作目录失败: {e}")))?;

        info!(
            batch = ctx.batch_seq,
            attempt = handle.attempt,
            "{} 🚀 启动工作进程 ({} 个代码, 存活 {} 个)",
            ctx,
            batch.codes.len(),
            self.registry.live_count()
        );

        match tokio::time::timeout(
            self.worker_timeout,
            self.worker.run_batch(&batch.codes, workspace, &self.cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WorkerError::retryable(format!(
                "工作进程超过 {}s 未完成",
                self.worker_timeout.as_secs()
            ))),
        }
    }
}
