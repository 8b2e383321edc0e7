//! 任务执行器 - 编排层
//!
//! ## 职责
//!
//! 整个应用的入口，负责一次任务从头到尾的生命周期：
//!
//! 1. **启动清理**：任务开始前清理泄漏进程、过期临时文件和占用的端口
//! 2. **恢复决定**：读取检查点，决定恢复、重新开始或直接复用已完成结果
//! 3. **调度**：把未完成批次交给调度器，消费调度事件并更新批次状态
//! 4. **检查点**：每结束 K 个批次（成功或放弃）保存一次，结束时再保存一次
//! 5. **校验**：所有批次结束后检查产出文件内容是否重复
//! 6. **报告**：汇总成功、放弃、未完成和疑似重复的批次
//!
//! ## 设计特点
//!
//! - **资源所有者**：唯一持有进程登记表和清理器的模块
//! - **部分失败容忍**：个别批次放弃不影响其他批次，任务照常返回报告
//! - **持久化失败不致命**：检查点写不进去只记录警告，任务继续

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, ResourceError};
use crate::infrastructure::{ProcFsTable, ProcessTable, ResourceProbe, SystemProbe};
use crate::models::{Artifact, BatchState, Checkpoint, InputIdentity, Job, WorkerRegistry};
use crate::orchestrator::scheduler::{DispatchEvent, Scheduler};
use crate::services::{
    ArtifactVerifier, CheckpointManager, DuplicateGroup, ProcessReaper, ResumeDecision,
    SweepKind, SweepReport,
};
use crate::utils::logging::{log_job_plan, log_startup};
use crate::worker::Worker;
use crate::workflow::{BatchFlow, BatchOutcome};

/// 停止标志：返回 `true` 时不再启动新的批次
pub type StopFlag = Arc<dyn Fn() -> bool + Send + Sync>;

/// 停止标志的轮询间隔
const STOP_FLAG_POLL: Duration = Duration::from_millis(500);

/// 进度回调
///
/// 在独立的任务里调用，慢回调不会拖住调度；返回的错误只记录日志。
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, processed: usize, total: usize) -> anyhow::Result<()>;
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize) -> anyhow::Result<()> + Send + Sync,
{
    fn on_progress(&self, processed: usize, total: usize) -> anyhow::Result<()> {
        self(processed, total)
    }
}

/// 被放弃的批次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedBatch {
    pub seq: u32,
    pub reason: String,
}

/// 任务报告
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub identity: InputIdentity,
    pub total_batches: usize,
    /// 成功批次的产出文件（按批次序号排列）
    pub succeeded: Vec<Artifact>,
    pub abandoned: Vec<AbandonedBatch>,
    /// 未到达终态的批次（中断或未开始）
    pub unfinished: Vec<u32>,
    pub duplicates: Vec<DuplicateGroup>,
    pub processed_codes: usize,
    /// 本次运行实际启动的批次数量
    pub dispatched: usize,
    /// 每个批次计入次数的尝试数量
    pub attempts: BTreeMap<u32, usize>,
    pub cancelled: bool,
    /// 本次运行执行的紧急清理次数
    pub emergency_sweeps: usize,
    /// 检查点是否可靠（写入失败后为 `false`）
    pub resumable: bool,
    pub resumed_from_checkpoint: bool,
    /// 同一输入之前已经完成，本次没有调度
    pub already_complete: bool,
}

impl JobReport {
    /// 至少一个批次成功
    pub fn is_success(&self) -> bool {
        !self.succeeded.is_empty()
    }

    /// 所有批次都到达终态
    pub fn is_complete(&self) -> bool {
        self.unfinished.is_empty()
    }

    pub fn suspected_duplicate_batches(&self) -> Vec<u32> {
        let mut seqs: Vec<u32> = self
            .duplicates
            .iter()
            .flat_map(|g| g.batch_seqs.iter().copied())
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        seqs
    }

    fn from_completed_checkpoint(checkpoint: Checkpoint, duplicates: Vec<DuplicateGroup>) -> Self {
        Self {
            job_id: checkpoint.job_id,
            identity: checkpoint.identity,
            total_batches: checkpoint.total_batches,
            succeeded: checkpoint.artifacts,
            abandoned: checkpoint
                .abandoned_batches
                .into_iter()
                .map(|seq| AbandonedBatch {
                    seq,
                    reason: "已在之前的运行中放弃".to_string(),
                })
                .collect(),
            unfinished: Vec::new(),
            duplicates,
            processed_codes: checkpoint.processed_count,
            dispatched: 0,
            attempts: BTreeMap::new(),
            cancelled: false,
            emergency_sweeps: 0,
            resumable: true,
            resumed_from_checkpoint: true,
            already_complete: true,
        }
    }
}

/// 任务执行器
pub struct JobRunner {
    config: Config,
    worker: Arc<dyn Worker>,
    probe: Arc<dyn ResourceProbe>,
    registry: Arc<WorkerRegistry>,
    reaper: Arc<ProcessReaper>,
    checkpoints: CheckpointManager,
    verifier: ArtifactVerifier,
    cancel: CancellationToken,
    progress: Option<Arc<dyn ProgressSink>>,
    stop_flag: Option<StopFlag>,
}

impl JobRunner {
    pub fn new(
        config: Config,
        worker: Arc<dyn Worker>,
        probe: Arc<dyn ResourceProbe>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let reaper = Arc::new(ProcessReaper::new(
            table,
            registry.clone(),
            config.reaper_settings(),
        ));
        let checkpoints = if config.checkpoint_enabled {
            CheckpointManager::new(&config.checkpoint_path, config.checkpoint_interval)
        } else {
            CheckpointManager::disabled()
        };
        Self {
            config,
            worker,
            probe,
            registry,
            reaper,
            checkpoints,
            verifier: ArtifactVerifier::new(),
            cancel: CancellationToken::new(),
            progress: None,
            stop_flag: None,
        }
    }

    /// 使用 /proc 进程表和系统探针
    pub fn system(config: Config, worker: Arc<dyn Worker>) -> Self {
        let table: Arc<dyn ProcessTable> = Arc::new(ProcFsTable::new());
        let probe = SystemProbe::new(
            table.clone(),
            config.process_name_patterns.clone(),
            config.probe_timeout(),
        )
        .with_disk_path(config.output_dir.clone());
        Self::new(config, worker, Arc::new(probe), table)
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Some(Arc::new(sink));
        self
    }

    pub fn with_stop_flag(mut self, flag: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.stop_flag = Some(Arc::new(flag));
        self
    }

    /// 取消令牌：触发后不再启动新批次，运行中的工作进程收到停止信号
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// 退出前的清理：终止所有匹配特征的进程
    pub async fn shutdown_sweep(&self) -> SweepReport {
        self.reaper.sweep(SweepKind::Shutdown).await
    }

    /// 运行一个任务
    ///
    /// 部分批次被放弃时仍返回 `Ok`；只有进程数量达到灾难阈值时返回
    /// `AppError::Halted`，其中附带中止时的报告。
    pub async fn run(&self, source: &str, codes: &[String]) -> AppResult<JobReport> {
        log_startup(&self.config);
        self.prepare_dirs().await?;

        let mut job = Job::new(source, codes, self.config.batch_size);
        let total_codes: usize = job.batches.iter().map(|b| b.codes.len()).sum();

        self.reaper.sweep(SweepKind::Startup).await;

        let mut resumed = false;
        let loaded = self.checkpoints.load().await;
        match CheckpointManager::decide(loaded, &job.identity, self.config.rerun_completed) {
            ResumeDecision::AlreadyComplete(checkpoint) => {
                let verification = self.verifier.verify(&checkpoint.artifacts).await;
                info!("✅ 检查点显示该输入已全部处理，不再调度");
                return Ok(JobReport::from_completed_checkpoint(
                    checkpoint,
                    verification.duplicates,
                ));
            }
            ResumeDecision::Resume(checkpoint) => {
                let restored = job.restore_from(&checkpoint);
                job.id = checkpoint.job_id.clone();
                info!(
                    "📂 从检查点恢复: {}/{} 个批次已完成",
                    restored, checkpoint.total_batches
                );
                resumed = true;
            }
            ResumeDecision::Fresh => {}
        }

        let pending = job.pending_batches();
        log_job_plan(total_codes, job.total_batches(), pending.len());

        // 后台任务：定时清理、停止标志、进度回调
        let background = self.cancel.child_token();
        let periodic = self
            .reaper
            .spawn_periodic(self.config.reaper_interval(), background.clone());
        let stop_watcher = self.spawn_stop_watcher(background.clone());
        let (progress_tx, progress_task) = self.spawn_progress(total_codes);

        let flow = Arc::new(BatchFlow::new(
            &self.config,
            self.worker.clone(),
            self.probe.clone(),
            self.reaper.clone(),
            self.registry.clone(),
            self.cancel.clone(),
        ));
        let scheduler = Scheduler::new(
            flow,
            self.config.dispatch_mode,
            self.config.max_parallel_workers,
            self.cancel.clone(),
            self.stop_flag.clone(),
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut state = RunState {
            resumable: self.checkpoints.is_enabled(),
            emergency_before: self.reaper.emergency_sweeps(),
            ..RunState::default()
        };

        let job_id = job.id.clone();
        let dispatch = scheduler.dispatch(&job_id, pending, job.total_batches(), events_tx);
        let consume = async {
            while let Some(event) = events_rx.recv().await {
                self.apply_event(&mut job, &mut state, event, progress_tx.as_ref())
                    .await;
            }
        };
        tokio::join!(dispatch, consume);

        background.cancel();
        let _ = periodic.await;
        if let Some(watcher) = stop_watcher {
            let _ = watcher.await;
        }
        drop(progress_tx);
        if let Some(task) = progress_task {
            let _ = task.await;
        }

        job.completed = job.all_terminal();
        self.save_checkpoint(&job, &mut state).await;

        let verification = self.verifier.verify(&job.artifacts()).await;
        self.reaper.sweep(SweepKind::Periodic).await;

        let report = self.build_report(
            &job,
            state.clone(),
            resumed,
            verification.hashed,
            verification.duplicates,
        );

        if let Some(reason) = state.halted {
            return Err(AppError::Halted {
                reason,
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// 输出目录和工作目录在第一次采样之前就要存在
    async fn prepare_dirs(&self) -> AppResult<()> {
        for dir in [&self.config.output_dir, &self.config.work_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::file_write_failed(dir.display().to_string(), e))?;
        }
        Ok(())
    }

    async fn apply_event(
        &self,
        job: &mut Job,
        state: &mut RunState,
        event: DispatchEvent,
        progress: Option<&mpsc::UnboundedSender<usize>>,
    ) {
        match event {
            DispatchEvent::Started { seq } => {
                state.dispatched += 1;
                if let Some(batch) = job.batch_mut(seq) {
                    batch.state = BatchState::Running;
                }
            }
            DispatchEvent::Settled(report) => {
                let Some(batch) = job.batch_mut(report.seq) else {
                    return;
                };
                batch.attempts.extend(report.attempts);
                match report.outcome {
                    BatchOutcome::Succeeded(artifact) => {
                        batch.succeed(artifact);
                        if let Some(tx) = progress {
                            let _ = tx.send(job.processed_count());
                        }
                        if self.checkpoints.is_due(job.terminal_count()) {
                            self.save_checkpoint(job, state).await;
                        }
                    }
                    BatchOutcome::Abandoned(reason) => {
                        batch.abandon(reason);
                        if self.checkpoints.is_due(job.terminal_count()) {
                            self.save_checkpoint(job, state).await;
                        }
                    }
                    BatchOutcome::Interrupted(reason) => {
                        info!("[批次 {}] ⏸ 已中断: {}", report.seq, reason);
                        batch.state = BatchState::Failed;
                        state.cancelled = true;
                    }
                }
            }
            DispatchEvent::Halted { seq, error } => {
                if let Some(batch) = job.batch_mut(seq) {
                    batch.state = BatchState::Failed;
                }
                state.halted.get_or_insert(error);
            }
        }
    }

    async fn save_checkpoint(&self, job: &Job, state: &mut RunState) {
        if !self.checkpoints.is_enabled() {
            return;
        }
        if let Err(e) = self.checkpoints.save(&job.checkpoint()).await {
            warn!("⚠️ {}，任务继续但本次运行可能无法恢复", e);
            state.resumable = false;
        }
    }

    fn spawn_stop_watcher(&self, done: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let flag = self.stop_flag.clone()?;
        let cancel = self.cancel.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(STOP_FLAG_POLL) => {
                        if flag() {
                            info!("⏹ 停止标志已设置，等待运行中的批次结束");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }))
    }

    fn spawn_progress(
        &self,
        total_codes: usize,
    ) -> (
        Option<mpsc::UnboundedSender<usize>>,
        Option<tokio::task::JoinHandle<()>>,
    ) {
        let Some(sink) = self.progress.clone() else {
            return (None, None);
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<usize>();
        let task = tokio::spawn(async move {
            while let Some(processed) = rx.recv().await {
                if let Err(e) = sink.on_progress(processed, total_codes) {
                    warn!("⚠️ 进度回调失败（已忽略）: {}", e);
                }
            }
        });
        (Some(tx), Some(task))
    }

    fn build_report(
        &self,
        job: &Job,
        state: RunState,
        resumed: bool,
        hashed: Vec<Artifact>,
        duplicates: Vec<DuplicateGroup>,
    ) -> JobReport {
        let hashes: BTreeMap<u32, Option<String>> = hashed
            .into_iter()
            .map(|a| (a.batch_seq, a.content_hash))
            .collect();

        let succeeded = job
            .artifacts()
            .into_iter()
            .map(|mut artifact| {
                if let Some(hash) = hashes.get(&artifact.batch_seq) {
                    artifact.content_hash = hash.clone();
                }
                artifact
            })
            .collect();

        JobReport {
            job_id: job.id.clone(),
            identity: job.identity.clone(),
            total_batches: job.total_batches(),
            succeeded,
            abandoned: job
                .batches
                .iter()
                .filter(|b| b.state == BatchState::Abandoned)
                .map(|b| AbandonedBatch {
                    seq: b.seq,
                    reason: b.failure.clone().unwrap_or_default(),
                })
                .collect(),
            unfinished: job
                .batches
                .iter()
                .filter(|b| !b.state.is_terminal())
                .map(|b| b.seq)
                .collect(),
            duplicates,
            processed_codes: job.processed_count(),
            dispatched: state.dispatched,
            attempts: job
                .batches
                .iter()
                .map(|b| (b.seq, b.attempts.len()))
                .collect(),
            cancelled: state.cancelled || self.cancel.is_cancelled(),
            emergency_sweeps: self
                .reaper
                .emergency_sweeps()
                .saturating_sub(state.emergency_before),
            resumable: state.resumable,
            resumed_from_checkpoint: resumed,
            already_complete: false,
        }
    }
}

/// 一次运行中的可变统计
#[derive(Debug, Clone, Default)]
struct RunState {
    dispatched: usize,
    cancelled: bool,
    resumable: bool,
    halted: Option<ResourceError>,
    emergency_before: usize,
}
