//! 工作槽调度器 - 编排层
//!
//! ## 职责
//!
//! 把待处理批次交给 `BatchFlow`，并控制同时运行的数量：
//!
//! - **独立模式**：所有批次一次性提交，由计数信号量控制并发，
//!   每个批次只等待空闲槽位，从不等待其他批次完成
//! - **窗口模式**：按并发上限分组，整窗结束后再开始下一窗
//! - **单批次**：不建池，直接在当前任务里运行
//!
//! 调度结果通过事件通道交给任务执行器，调度器自身不修改任务状态。

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DispatchMode;
use crate::error::ResourceError;
use crate::models::Batch;
use crate::orchestrator::job_runner::StopFlag;
use crate::utils::logging::{log_window_complete, log_window_start};
use crate::workflow::{BatchCtx, BatchFlow, BatchReport};

/// 调度事件
#[derive(Debug)]
pub enum DispatchEvent {
    /// 批次开始运行
    Started { seq: u32 },
    /// 批次到达终态或被中断
    Settled(BatchReport),
    /// 资源灾难，停止调度
    Halted { seq: u32, error: ResourceError },
}

/// 工作槽调度器
pub struct Scheduler {
    flow: Arc<BatchFlow>,
    mode: DispatchMode,
    ceiling: usize,
    cancel: CancellationToken,
    halted: CancellationToken,
    stop_flag: Option<StopFlag>,
}

impl Scheduler {
    pub fn new(
        flow: Arc<BatchFlow>,
        mode: DispatchMode,
        ceiling: usize,
        cancel: CancellationToken,
        stop_flag: Option<StopFlag>,
    ) -> Self {
        Self {
            flow,
            mode,
            ceiling: ceiling.max(1),
            cancel,
            halted: CancellationToken::new(),
            stop_flag,
        }
    }

    /// 调度所有批次，全部结束后返回
    pub async fn dispatch(
        &self,
        job_id: &str,
        batches: Vec<Batch>,
        total_batches: usize,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) {
        if batches.is_empty() {
            return;
        }

        if batches.len() == 1 {
            info!("📦 仅有一个待处理批次，直接运行");
            let gate = self.gate();
            let ctx = BatchCtx::new(job_id, batches[0].seq, total_batches);
            run_one(&self.flow, &batches[0], &ctx, &gate, &events).await;
            return;
        }

        match self.mode {
            DispatchMode::Independent => {
                self.dispatch_independent(job_id, batches, total_batches, events)
                    .await
            }
            DispatchMode::Windowed => {
                self.dispatch_windowed(job_id, batches, total_batches, events)
                    .await
            }
        }
    }

    async fn dispatch_independent(
        &self,
        job_id: &str,
        batches: Vec<Batch>,
        total_batches: usize,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) {
        info!(
            "🚀 独立模式: 一次提交 {} 个批次，最多 {} 个同时运行",
            batches.len(),
            self.ceiling
        );
        let semaphore = Arc::new(Semaphore::new(self.ceiling));
        let mut tasks = JoinSet::new();

        for batch in batches {
            let semaphore = semaphore.clone();
            let flow = self.flow.clone();
            let events = events.clone();
            let gate = self.gate();
            let ctx = BatchCtx::new(job_id, batch.seq, total_batches);

            tasks.spawn(async move {
                let permit = tokio::select! {
                    _ = gate.cancel.cancelled() => None,
                    _ = gate.halted.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return;
                };
                run_one(&flow, &batch, &ctx, &gate, &events).await;
            });
        }
        drop(events);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("批次任务执行失败: {}", e);
            }
        }
    }

    async fn dispatch_windowed(
        &self,
        job_id: &str,
        batches: Vec<Batch>,
        total_batches: usize,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) {
        let windows: Vec<&[Batch]> = batches.chunks(self.ceiling).collect();
        let total_windows = windows.len();
        info!(
            "🚀 窗口模式: {} 个批次分为 {} 个窗口，每窗最多 {} 个",
            batches.len(),
            total_windows,
            self.ceiling
        );

        for (i, window) in windows.into_iter().enumerate() {
            let gate = self.gate();
            if gate.should_stop() {
                warn!("⏹ 停止调度，剩余 {} 个窗口未开始", total_windows - i);
                break;
            }
            let first = window.first().map(|b| b.seq).unwrap_or_default();
            let last = window.last().map(|b| b.seq).unwrap_or_default();
            log_window_start(i + 1, total_windows, first, last);

            let mut tasks = JoinSet::new();
            for batch in window.iter().cloned() {
                let flow = self.flow.clone();
                let events = events.clone();
                let gate = self.gate();
                let ctx = BatchCtx::new(job_id, batch.seq, total_batches);
                tasks.spawn(async move {
                    run_one(&flow, &batch, &ctx, &gate, &events).await;
                });
            }

            let mut settled = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(()) => settled += 1,
                    Err(e) => error!("批次任务执行失败: {}", e),
                }
            }
            log_window_complete(i + 1, settled, window.len());
        }
    }

    fn gate(&self) -> Gate {
        Gate {
            cancel: self.cancel.clone(),
            halted: self.halted.clone(),
            stop_flag: self.stop_flag.clone(),
        }
    }
}

/// 每个批次开始前检查的停止条件
#[derive(Clone)]
struct Gate {
    cancel: CancellationToken,
    halted: CancellationToken,
    stop_flag: Option<StopFlag>,
}

impl Gate {
    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() || self.halted.is_cancelled() {
            return true;
        }
        if self.stop_flag.as_ref().is_some_and(|flag| flag()) {
            info!("⏹ 停止标志已设置，不再启动新的批次");
            self.cancel.cancel();
            return true;
        }
        false
    }
}

async fn run_one(
    flow: &BatchFlow,
    batch: &Batch,
    ctx: &BatchCtx,
    gate: &Gate,
    events: &mpsc::UnboundedSender<DispatchEvent>,
) {
    if gate.should_stop() {
        return;
    }
    // 接收端只在任务结束后关闭，发送失败可以忽略
    let _ = events.send(DispatchEvent::Started { seq: batch.seq });
    match flow.run(batch, ctx).await {
        Ok(report) => {
            let _ = events.send(DispatchEvent::Settled(report));
        }
        Err(error) => {
            error!("{} 🚨 {}，停止调度", ctx, error);
            gate.halted.cancel();
            let _ = events.send(DispatchEvent::Halted {
                seq: batch.seq,
                error,
            });
        }
    }
}
