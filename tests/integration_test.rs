//! 任务编排的端到端场景
//!
//! 使用内存中的进程表、脚本化的资源探针和写本地文件的假工作进程，
//! 不需要浏览器。依赖浏览器的测试默认忽略：cargo test -- --ignored

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use price_fetch_runner::config::{Config, DispatchMode};
use price_fetch_runner::error::{AppError, AppResult, ResourceError, WorkerError};
use price_fetch_runner::infrastructure::{
    KillOutcome, KillSignal, ProcessInfo, ProcessTable, ResourceProbe,
};
use price_fetch_runner::models::{
    Artifact, Batch, Checkpoint, Job, ResourceSample, WorkerRegistry,
};
use price_fetch_runner::orchestrator::JobRunner;
use price_fetch_runner::services::{CheckpointManager, ProcessReaper};
use price_fetch_runner::worker::{Worker, Workspace};
use price_fetch_runner::workflow::{BatchCtx, BatchFlow, BatchOutcome};

const SOURCE: &str = "codes.txt";

// ========== 测试替身 ==========

/// 内存进程表：收到信号的进程立刻消失
#[derive(Default)]
struct FakeTable {
    processes: Mutex<Vec<ProcessInfo>>,
}

impl FakeTable {
    fn with_leaked_chrome(count: u32) -> Self {
        let processes = (0..count)
            .map(|i| ProcessInfo {
                pid: 5000 + i,
                ppid: 1,
                name: "chrome".to_string(),
                cmdline: "/opt/google/chrome/chrome --headless".to_string(),
                age: Duration::from_secs(60),
            })
            .collect();
        Self {
            processes: Mutex::new(processes),
        }
    }

    fn len(&self) -> usize {
        self.processes.lock().unwrap().len()
    }
}

impl ProcessTable for FakeTable {
    fn list(&self) -> AppResult<Vec<ProcessInfo>> {
        Ok(self.processes.lock().unwrap().clone())
    }

    fn signal(&self, pid: u32, _sig: KillSignal) -> KillOutcome {
        let mut processes = self.processes.lock().unwrap();
        let before = processes.len();
        processes.retain(|p| p.pid != pid);
        if processes.len() < before {
            KillOutcome::Signalled
        } else {
            KillOutcome::AlreadyGone
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().unwrap().iter().any(|p| p.pid == pid)
    }

    fn listening_pids(&self, _port: u16) -> Vec<u32> {
        Vec::new()
    }
}

/// 按脚本依次返回采样，脚本用完后一直返回 `fallback`
struct ScriptedProbe {
    script: Mutex<VecDeque<ResourceSample>>,
    fallback: ResourceSample,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn healthy() -> Self {
        Self::scripted(Vec::new(), healthy())
    }

    fn scripted(script: Vec<ResourceSample>, fallback: ResourceSample) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProbe for ScriptedProbe {
    async fn sample(&self) -> ResourceSample {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

fn sample(available_memory_mb: u64, cpu_percent: f32, process_count: usize) -> ResourceSample {
    ResourceSample {
        available_memory_mb,
        memory_percent: 40.0,
        cpu_percent,
        free_disk_mb: 50_000,
        process_count,
        known: true,
    }
}

fn healthy() -> ResourceSample {
    sample(8_000, 10.0, 0)
}

/// 把本批代码写进下载目录的假工作进程
#[derive(Default)]
struct FakeWorker {
    /// 批次中含有该代码时返回致命错误
    fatal_code: Option<String>,
    /// 批次中含有该代码时第一次返回可重试错误
    flaky_code: Option<String>,
    flaked: Mutex<HashSet<String>>,
    /// 每次都返回可重试错误
    always_retryable: bool,
    /// 第一次调用报告资源不足
    exhausted_once: bool,
    exhausted: AtomicBool,
    /// 一直运行到收到停止信号
    wait_for_stop: bool,
    /// 开始工作前读取该检查点，记录其中已放弃的批次
    watch_checkpoint: Option<PathBuf>,
    seen_abandoned: Mutex<Vec<Vec<u32>>>,
    /// 所有批次写出相同内容
    same_content: bool,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeWorker {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn export(
        &self,
        codes: &[String],
        workspace: &Workspace,
        stop: &CancellationToken,
    ) -> Result<PathBuf, WorkerError> {
        if let Some(path) = &self.watch_checkpoint {
            let abandoned = std::fs::read(path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<Checkpoint>(&raw).ok())
                .map(|cp| cp.abandoned_batches)
                .unwrap_or_default();
            self.seen_abandoned.lock().unwrap().push(abandoned);
        }
        if self.wait_for_stop {
            tokio::select! {
                _ = stop.cancelled() => return Err(WorkerError::retryable("页面加载被中止")),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }
        if self.always_retryable {
            return Err(WorkerError::retryable("导出按钮未响应"));
        }
        if self.exhausted_once && !self.exhausted.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::resource_exhausted("浏览器启动失败: 内存不足"));
        }
        if let Some(code) = &self.fatal_code {
            if codes.contains(code) {
                return Err(WorkerError::fatal("页面结构不匹配"));
            }
        }
        if let Some(code) = &self.flaky_code {
            if codes.contains(code) && self.flaked.lock().unwrap().insert(code.clone()) {
                return Err(WorkerError::retryable("连接被重置"));
            }
        }
        let content = if self.same_content {
            "gtin,price\n".to_string()
        } else {
            codes.join("\n")
        };
        let path = workspace.output_dir.join("export.xlsx");
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| WorkerError::retryable(e.to_string()))?;
        Ok(path)
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn run_batch(
        &self,
        codes: &[String],
        workspace: &Workspace,
        stop: &CancellationToken,
    ) -> Result<PathBuf, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = self.export(codes, workspace, stop).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ========== 辅助函数 ==========

fn test_config(dir: &Path) -> Config {
    Config {
        max_parallel_workers: 2,
        batch_size: 10,
        worker_start_delay_sec: 0.0,
        admission_cooldown_sec: 0.01,
        backoff_base_sec: 0.0,
        reaper_grace_ms: 0,
        reaper_interval_sec: 0,
        stale_ports: Vec::new(),
        temp_dir: dir.join("temp"),
        output_dir: dir.join("out"),
        work_dir: dir.join("runs"),
        checkpoint_path: dir.join("checkpoint.json"),
        ..Config::default()
    }
}

fn codes(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{:013}", 4_000_000_000_000u64 + i as u64)).collect()
}

fn runner(config: Config, worker: Arc<FakeWorker>, probe: Arc<ScriptedProbe>) -> JobRunner {
    JobRunner::new(config, worker, probe, Arc::new(FakeTable::default()))
}

fn batch_flow(
    config: &Config,
    worker: Arc<FakeWorker>,
    probe: Arc<ScriptedProbe>,
) -> (BatchFlow, Arc<WorkerRegistry>) {
    let table: Arc<dyn ProcessTable> = Arc::new(FakeTable::default());
    let registry = Arc::new(WorkerRegistry::new());
    let reaper = Arc::new(ProcessReaper::new(
        table,
        registry.clone(),
        config.reaper_settings(),
    ));
    let flow = BatchFlow::new(
        config,
        worker,
        probe,
        reaper,
        registry.clone(),
        CancellationToken::new(),
    );
    (flow, registry)
}

// ========== 场景 ==========

#[tokio::test]
async fn test_three_batches_all_succeed_and_checkpoint_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let checkpoint_path = config.checkpoint_path.clone();
    let worker = Arc::new(FakeWorker::default());

    let report = assert_ok!(
        runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
            .run(SOURCE, &codes(25))
            .await
    );

    assert_eq!(report.total_batches, 3);
    assert_eq!(report.succeeded.len(), 3);
    assert!(report.abandoned.is_empty());
    assert!(report.is_complete());
    assert_eq!(report.processed_codes, 25);
    assert_eq!(worker.calls(), 3);
    assert!(report.duplicates.is_empty());

    // 产出文件互不覆盖
    let names: HashSet<String> = report.succeeded.iter().map(Artifact::file_name).collect();
    assert_eq!(names.len(), 3);
    assert!(report.succeeded.iter().all(|a| a.path.exists()));
    assert!(report.succeeded.iter().all(|a| a.content_hash.is_some()));

    let checkpoint = CheckpointManager::new(&checkpoint_path, 5)
        .load()
        .await
        .expect("检查点应存在");
    assert_eq!(checkpoint.completed_batches, 3);
    assert_eq!(checkpoint.processed_count, 25);
    assert!(checkpoint.completed);
}

#[tokio::test]
async fn test_denied_twice_then_admitted_counts_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let worker: Arc<FakeWorker> = Arc::new(FakeWorker::default());
    let probe = Arc::new(ScriptedProbe::scripted(
        vec![sample(100, 10.0, 0), sample(100, 10.0, 0)],
        healthy(),
    ));
    let (flow, registry) = batch_flow(&config, worker.clone(), probe.clone());

    let batch = Batch::new(1, codes(5));
    let report = flow
        .run(&batch, &BatchCtx::new("job-test", 1, 1))
        .await
        .unwrap();

    assert!(matches!(report.outcome, BatchOutcome::Succeeded(_)));
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.resource_rechecks, 2);
    assert_eq!(probe.calls(), 3);
    assert_eq!(worker.calls(), 1);
    assert_eq!(registry.live_count(), 0);
}

#[tokio::test]
async fn test_fatal_batch_is_abandoned_others_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let input = codes(25);
    let worker = Arc::new(FakeWorker {
        fatal_code: Some(input[0].clone()),
        ..FakeWorker::default()
    });

    let report = assert_ok!(
        runner(
            test_config(dir.path()),
            worker.clone(),
            Arc::new(ScriptedProbe::healthy())
        )
        .run(SOURCE, &input)
        .await
    );

    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].seq, 1);
    // 致命错误不重试
    assert_eq!(report.attempts[&1], 1);
    assert_eq!(worker.calls(), 3);
    assert!(report.is_success());
    assert!(report.is_complete());
}

#[tokio::test]
async fn test_retryable_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let input = codes(15);
    let worker = Arc::new(FakeWorker {
        flaky_code: Some(input[12].clone()),
        ..FakeWorker::default()
    });

    let report = runner(
        test_config(dir.path()),
        worker.clone(),
        Arc::new(ScriptedProbe::healthy()),
    )
    .run(SOURCE, &input)
    .await
    .unwrap();

    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.attempts[&1], 1);
    assert_eq!(report.attempts[&2], 2);
    assert_eq!(worker.calls(), 3);
}

#[tokio::test]
async fn test_process_overflow_triggers_emergency_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::with_leaked_chrome(3));
    let probe = Arc::new(ScriptedProbe::scripted(vec![sample(8_000, 10.0, 60)], healthy()));
    let worker = Arc::new(FakeWorker::default());

    let runner = JobRunner::new(
        test_config(dir.path()),
        worker.clone(),
        probe.clone(),
        table.clone(),
    );
    let report = runner.run(SOURCE, &codes(5)).await.unwrap();

    assert_eq!(report.emergency_sweeps, 1);
    assert_eq!(report.succeeded.len(), 1);
    // 紧急清理后重新采样
    assert_eq!(probe.calls(), 2);
    assert_eq!(table.len(), 0);
}

#[tokio::test]
async fn test_catastrophic_process_count_halts_job() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(FakeWorker::default());
    let probe = Arc::new(ScriptedProbe::scripted(Vec::new(), sample(8_000, 10.0, 150)));

    let result = runner(test_config(dir.path()), worker.clone(), probe)
        .run(SOURCE, &codes(25))
        .await;

    let err = assert_err!(result);
    match err {
        AppError::Halted { reason, report } => {
            assert_eq!(
                reason,
                ResourceError::CatastrophicProcessCount {
                    count: 150,
                    limit: 100
                }
            );
            assert!(report.succeeded.is_empty());
            assert!(!report.is_complete());
        }
        other => panic!("意外的错误: {other}"),
    }
    assert_eq!(worker.calls(), 0);
}

#[tokio::test]
async fn test_live_workers_never_exceed_recommendation() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_parallel_workers: 4,
        ..test_config(dir.path())
    };
    // 内存处于中档：建议并发为上限的一半
    let probe = Arc::new(ScriptedProbe::scripted(Vec::new(), sample(500, 10.0, 0)));
    let worker = Arc::new(FakeWorker {
        delay: Duration::from_millis(50),
        ..FakeWorker::default()
    });

    let runner = runner(config, worker.clone(), probe);
    let report = runner.run(SOURCE, &codes(60)).await.unwrap();

    assert_eq!(report.succeeded.len(), 6);
    let peak = runner.registry().peak();
    assert!((1..=2).contains(&peak), "peak = {peak}");
    assert!(worker.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_windowed_mode_processes_every_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        dispatch_mode: DispatchMode::Windowed,
        ..test_config(dir.path())
    };
    let worker = Arc::new(FakeWorker::default());

    let report = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
        .run(SOURCE, &codes(45))
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 5);
    assert_eq!(worker.calls(), 5);
    assert!(worker.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_completed_checkpoint_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = codes(25);
    let worker = Arc::new(FakeWorker::default());

    let first = runner(
        test_config(dir.path()),
        worker.clone(),
        Arc::new(ScriptedProbe::healthy()),
    )
    .run(SOURCE, &input)
    .await
    .unwrap();
    assert_eq!(worker.calls(), 3);

    let second = runner(
        test_config(dir.path()),
        worker.clone(),
        Arc::new(ScriptedProbe::healthy()),
    )
    .run(SOURCE, &input)
    .await
    .unwrap();

    assert!(second.already_complete);
    assert_eq!(second.dispatched, 0);
    assert_eq!(worker.calls(), 3);
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.succeeded.len(), 3);

    // 显式要求重跑时从头开始
    let config = Config {
        rerun_completed: true,
        ..test_config(dir.path())
    };
    let third = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
        .run(SOURCE, &input)
        .await
        .unwrap();
    assert!(!third.already_complete);
    assert_eq!(worker.calls(), 6);
}

#[tokio::test]
async fn test_resume_skips_succeeded_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let input = codes(25);

    // 上一次运行只完成了第 1 批
    let previous = dir.path().join("previous.xlsx");
    std::fs::write(&previous, "rows").unwrap();
    let mut job = Job::new(SOURCE, &input, config.batch_size);
    job.batch_mut(1)
        .unwrap()
        .succeed(Artifact::new(1, previous.clone(), 4));
    CheckpointManager::new(&config.checkpoint_path, 5)
        .save(&job.checkpoint())
        .await
        .unwrap();

    let worker = Arc::new(FakeWorker::default());
    let report = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
        .run(SOURCE, &input)
        .await
        .unwrap();

    assert!(report.resumed_from_checkpoint);
    assert_eq!(report.job_id, job.id);
    assert_eq!(worker.calls(), 2);
    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.succeeded[0].path, previous);
    assert_eq!(report.processed_codes, 25);
}

#[tokio::test]
async fn test_different_input_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(FakeWorker::default());

    runner(
        test_config(dir.path()),
        worker.clone(),
        Arc::new(ScriptedProbe::healthy()),
    )
    .run(SOURCE, &codes(25))
    .await
    .unwrap();

    let report = runner(
        test_config(dir.path()),
        worker.clone(),
        Arc::new(ScriptedProbe::healthy()),
    )
    .run(SOURCE, &codes(15))
    .await
    .unwrap();

    assert!(!report.resumed_from_checkpoint);
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(worker.calls(), 5);
}

#[tokio::test]
async fn test_identical_outputs_are_flagged_not_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(FakeWorker {
        same_content: true,
        ..FakeWorker::default()
    });

    let report = runner(
        test_config(dir.path()),
        worker,
        Arc::new(ScriptedProbe::healthy()),
    )
    .run(SOURCE, &codes(25))
    .await
    .unwrap();

    assert_eq!(report.suspected_duplicate_batches(), vec![1, 2, 3]);
    assert_eq!(report.succeeded.len(), 3);
    assert!(report.succeeded.iter().all(|a| a.path.exists()));
}

#[tokio::test]
async fn test_stop_flag_prevents_new_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let checkpoint_path = config.checkpoint_path.clone();
    let worker = Arc::new(FakeWorker::default());

    let report = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
        .with_stop_flag(|| true)
        .run(SOURCE, &codes(25))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(worker.calls(), 0);
    assert_eq!(report.unfinished, vec![1, 2, 3]);

    // 中断后仍保存检查点，供下次恢复
    let checkpoint = CheckpointManager::new(&checkpoint_path, 5)
        .load()
        .await
        .expect("检查点应存在");
    assert!(!checkpoint.completed);
    assert_eq!(checkpoint.completed_batches, 0);
}

#[tokio::test]
async fn test_progress_reports_processed_codes() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    runner(
        test_config(dir.path()),
        Arc::new(FakeWorker::default()),
        Arc::new(ScriptedProbe::healthy()),
    )
    .with_progress(move |processed: usize, total: usize| -> anyhow::Result<()> {
        sink.lock().unwrap().push((processed, total));
        Ok(())
    })
    .run(SOURCE, &codes(25))
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, total)| *total == 25));
    assert_eq!(seen.iter().map(|(p, _)| *p).max(), Some(25));
}

#[tokio::test]
async fn test_worker_resource_shortage_uses_recheck_budget() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let worker = Arc::new(FakeWorker {
        exhausted_once: true,
        ..FakeWorker::default()
    });
    let (flow, registry) = batch_flow(&config, worker.clone(), Arc::new(ScriptedProbe::healthy()));

    let report = flow
        .run(&Batch::new(1, codes(5)), &BatchCtx::new("job-test", 1, 1))
        .await
        .unwrap();

    assert!(matches!(report.outcome, BatchOutcome::Succeeded(_)));
    // 资源不足不计入尝试次数
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.resource_rechecks, 1);
    assert_eq!(worker.calls(), 2);
    assert_eq!(registry.live_count(), 0);
}

#[tokio::test]
async fn test_persistent_retryable_failure_stops_at_attempt_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let ceiling = config.attempt_ceiling as usize;
    let worker = Arc::new(FakeWorker {
        always_retryable: true,
        ..FakeWorker::default()
    });

    let report = assert_ok!(
        runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
            .run(SOURCE, &codes(5))
            .await
    );

    assert!(report.succeeded.is_empty());
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].seq, 1);
    assert_eq!(report.attempts[&1], ceiling);
    assert_eq!(worker.calls(), ceiling);
    assert!(report.is_complete());
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_unwritable_checkpoint_keeps_job_running() {
    let dir = tempfile::tempdir().unwrap();
    // 检查点目录的位置被一个普通文件占着
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let config = Config {
        checkpoint_path: blocker.join("checkpoint.json"),
        ..test_config(dir.path())
    };
    let worker = Arc::new(FakeWorker::default());

    let report = assert_ok!(
        runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
            .run(SOURCE, &codes(25))
            .await
    );

    assert_eq!(report.succeeded.len(), 3);
    assert!(report.is_complete());
    assert!(!report.resumable);
    assert_eq!(worker.calls(), 3);
}

#[tokio::test]
async fn test_stop_while_worker_runs_leaves_batch_unfinished() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let checkpoint_path = config.checkpoint_path.clone();
    let worker = Arc::new(FakeWorker {
        wait_for_stop: true,
        ..FakeWorker::default()
    });

    let runner = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()));
    let token = runner.cancellation_token();
    let in_flight = worker.clone();
    tokio::spawn(async move {
        while in_flight.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), runner.run(SOURCE, &codes(5)))
        .await
        .expect("停止后任务应很快返回")
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(worker.calls(), 1);
    assert_eq!(report.unfinished, vec![1]);
    assert!(report.abandoned.is_empty());
    assert!(report.succeeded.is_empty());

    let checkpoint = CheckpointManager::new(&checkpoint_path, 5)
        .load()
        .await
        .expect("检查点应存在");
    assert!(!checkpoint.completed);
    assert_eq!(checkpoint.completed_batches, 0);
    assert!(checkpoint.abandoned_batches.is_empty());
}

#[tokio::test]
async fn test_checkpoint_interval_counts_abandoned_batches() {
    let dir = tempfile::tempdir().unwrap();
    let input = codes(20);
    let config = Config {
        max_parallel_workers: 1,
        checkpoint_interval: 1,
        ..test_config(dir.path())
    };
    let worker = Arc::new(FakeWorker {
        fatal_code: Some(input[0].clone()),
        watch_checkpoint: Some(config.checkpoint_path.clone()),
        delay: Duration::from_millis(200),
        ..FakeWorker::default()
    });

    let report = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
        .run(SOURCE, &input)
        .await
        .unwrap();

    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.succeeded.len(), 1);
    // 第 2 批开始时，第 1 批的放弃已经写进检查点
    let seen = worker.seen_abandoned.lock().unwrap();
    assert_eq!(*seen, vec![Vec::<u32>::new(), vec![1]]);
}

#[tokio::test]
async fn test_batch_size_change_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let input = codes(20);

    // 上一次按 10 个一批运行，完成了第 1 批
    let previous = dir.path().join("previous.xlsx");
    std::fs::write(&previous, "rows").unwrap();
    let mut job = Job::new(SOURCE, &input, 10);
    job.batch_mut(1)
        .unwrap()
        .succeed(Artifact::new(1, previous.clone(), 4));
    let config = Config {
        batch_size: 5,
        ..test_config(dir.path())
    };
    CheckpointManager::new(&config.checkpoint_path, 5)
        .save(&job.checkpoint())
        .await
        .unwrap();

    let worker = Arc::new(FakeWorker::default());
    let report = runner(config, worker.clone(), Arc::new(ScriptedProbe::healthy()))
        .run(SOURCE, &input)
        .await
        .unwrap();

    assert!(!report.resumed_from_checkpoint);
    assert_eq!(report.total_batches, 4);
    assert_eq!(worker.calls(), 4);
    assert_eq!(report.processed_codes, 20);
    assert!(report.succeeded.iter().all(|a| a.path != previous));
}

#[tokio::test]
async fn test_system_runner_creates_missing_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        min_free_memory_mb: 0,
        max_cpu_percent: 100,
        process_name_patterns: vec!["price-fetch-runner-no-such-process".to_string()],
        ..test_config(dir.path())
    };
    let output_dir = config.output_dir.clone();
    assert!(!output_dir.exists());
    let worker = Arc::new(FakeWorker::default());

    let report = assert_ok!(
        JobRunner::system(config, worker.clone())
            .run(SOURCE, &codes(25))
            .await
    );

    assert!(report.abandoned.is_empty(), "{:?}", report.abandoned);
    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(worker.calls(), 3);
    assert!(report.succeeded.iter().all(|a| a.path.starts_with(&output_dir)));
}

#[tokio::test]
#[ignore] // 需要本机安装 Chrome/Chromium 以及导出脚本：cargo test -- --ignored
async fn test_browser_worker_single_batch() {
    use price_fetch_runner::worker::{BrowserWorker, BrowserWorkerSettings};

    price_fetch_runner::utils::logging::init(true);
    let config = Config::from_env();
    let settings = BrowserWorkerSettings::from_config(&config).expect("导出脚本无效");
    let worker = Arc::new(BrowserWorker::new(settings));

    let input = price_fetch_runner::models::load_codes(&config.input_file)
        .await
        .expect("无法读取代码文件");
    let report = JobRunner::system(config, worker)
        .run(SOURCE, &input[..input.len().min(10)])
        .await
        .expect("任务失败");
    assert!(report.is_success(), "至少一个批次应该成功");
}
