//! 进程清理器 - 业务能力层
//!
//! 找出与工作进程特征匹配的系统进程，终止其中泄漏的（不属于任何存活
//! 句柄）或超龄的进程，回收被占用的调试端口和过期临时文件。
//!
//! 清理是幂等的：进程在扫描和发信号之间自行退出属于正常竞争，只计数不报错。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infrastructure::process_table::{KillOutcome, KillSignal, ProcessInfo, ProcessTable};
use crate::models::{WorkerHandle, WorkerRegistry};

/// 清理器设置
#[derive(Debug, Clone, PartialEq)]
pub struct ReaperSettings {
    /// 工作进程名特征
    pub patterns: Vec<String>,
    /// 超过该运行时间的进程一律清理
    pub max_age: Duration,
    /// 需要回收的监听端口
    pub stale_ports: Vec<u16>,
    pub temp_dir: PathBuf,
    pub temp_max_age: Duration,
    /// SIGTERM 与 SIGKILL 之间的等待
    pub grace: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            patterns: vec![
                "chrome".to_string(),
                "chromium".to_string(),
                "chromedriver".to_string(),
            ],
            max_age: Duration::from_secs(20 * 60),
            stale_ports: vec![9515, 9222, 9223, 9224, 9225],
            temp_dir: PathBuf::from("temp_files"),
            temp_max_age: Duration::from_secs(30 * 60),
            grace: Duration::from_millis(500),
        }
    }
}

/// 清理触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// 任务开始前
    Startup,
    /// 定时清理
    Periodic,
    /// 每次启动工作进程之前
    PreLaunch,
    /// 外部进程数量超过高水位
    Emergency,
    /// 程序退出
    Shutdown,
}

impl SweepKind {
    fn label(self) -> &'static str {
        match self {
            SweepKind::Startup => "启动清理",
            SweepKind::Periodic => "定时清理",
            SweepKind::PreLaunch => "启动前清理",
            SweepKind::Emergency => "紧急清理",
            SweepKind::Shutdown => "退出清理",
        }
    }

    /// 是否跳过 SIGTERM 直接 SIGKILL
    fn immediate_kill(self) -> bool {
        matches!(self, SweepKind::Emergency)
    }

    fn reclaims_ports(self) -> bool {
        !matches!(self, SweepKind::PreLaunch)
    }

    fn reclaims_temp(self) -> bool {
        !matches!(self, SweepKind::PreLaunch)
    }
}

/// 一次清理的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 匹配特征的进程数量
    pub matched: usize,
    /// 其中属于存活句柄的数量
    pub tracked: usize,
    /// 本次清理的进程
    pub reaped: Vec<u32>,
    /// 发信号前已退出
    pub already_gone: usize,
    /// 没有权限
    pub denied: usize,
    pub ports_reclaimed: usize,
    pub temp_files_removed: usize,
}

/// 进程清理器
pub struct ProcessReaper {
    table: Arc<dyn ProcessTable>,
    registry: Arc<WorkerRegistry>,
    settings: ReaperSettings,
    // 同一时刻只跑一次清理
    sweep_lock: Mutex<()>,
    emergency_sweeps: AtomicUsize,
}

impl ProcessReaper {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        registry: Arc<WorkerRegistry>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            table,
            registry,
            settings,
            sweep_lock: Mutex::new(()),
            emergency_sweeps: AtomicUsize::new(0),
        }
    }

    /// 已执行的紧急清理次数
    pub fn emergency_sweeps(&self) -> usize {
        self.emergency_sweeps.load(Ordering::Relaxed)
    }

    /// 执行一次清理
    pub async fn sweep(&self, kind: SweepKind) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();
        if kind == SweepKind::Emergency {
            self.emergency_sweeps.fetch_add(1, Ordering::Relaxed);
        }

        let processes = self.list_processes().await;
        let handles = self.registry.snapshot();
        let markers: Vec<String> = handles.iter().map(WorkerHandle::marker).collect();
        let tracked = tracked_pids(&processes, &markers);
        self.backfill_pids(&processes, &handles);

        let matched: Vec<&ProcessInfo> = processes
            .iter()
            .filter(|p| p.matches_any(&self.settings.patterns))
            .collect();
        report.matched = matched.len();
        report.tracked = matched.iter().filter(|p| tracked.contains(&p.pid)).count();

        let targets: Vec<u32> = matched
            .iter()
            .filter(|p| match kind {
                SweepKind::Shutdown => true,
                _ => !tracked.contains(&p.pid) || p.age > self.settings.max_age,
            })
            .map(|p| p.pid)
            .collect();

        if !targets.is_empty() {
            info!(
                "🧹 {}: 匹配 {} 个进程，其中受管 {} 个，清理 {} 个",
                kind.label(),
                report.matched,
                report.tracked,
                targets.len()
            );
        }
        self.terminate(&targets, kind.immediate_kill(), &mut report)
            .await;

        if kind.reclaims_ports() {
            let exempt = if kind == SweepKind::Shutdown {
                HashSet::new()
            } else {
                tracked
            };
            report.ports_reclaimed = self.reclaim_ports(&processes, &exempt).await;
        }
        if kind.reclaims_temp() {
            report.temp_files_removed = self.reclaim_temp_files().await;
        }

        if report.reaped.is_empty() && report.ports_reclaimed == 0 {
            debug!("{}: 无需清理 (匹配 {} 个进程)", kind.label(), report.matched);
        } else {
            info!(
                "✓ {}完成: 终止 {} 个进程, 回收 {} 个端口, 删除 {} 个临时文件",
                kind.label(),
                report.reaped.len(),
                report.ports_reclaimed,
                report.temp_files_removed
            );
        }
        report
    }

    /// 终止某个句柄启动的所有进程（含子进程）
    pub async fn terminate_handle(&self, handle: &WorkerHandle) -> usize {
        let processes = self.list_processes().await;
        let owned: Vec<u32> = tracked_pids(&processes, &[handle.marker()])
            .into_iter()
            .collect();
        if owned.is_empty() {
            return 0;
        }
        debug!(
            batch = handle.batch_seq,
            attempt = handle.attempt,
            "终止工作进程残留: {:?}",
            owned
        );
        let mut report = SweepReport::default();
        self.terminate(&owned, false, &mut report).await;
        report.reaped.len()
    }

    /// 删除临时目录中过期的文件，返回删除数量
    pub async fn reclaim_temp_files(&self) -> usize {
        let dir = self.settings.temp_dir.clone();
        let max_age = self.settings.temp_max_age;
        tokio::task::spawn_blocking(move || remove_old_files(&dir, max_age, SystemTime::now()))
            .await
            .unwrap_or(0)
    }

    /// 启动后台定时清理，取消令牌触发后退出
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        tokio::spawn(async move {
            if interval.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回，启动清理已经单独做过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        reaper.sweep(SweepKind::Periodic).await;
                    }
                }
            }
            debug!("定时清理已停止");
        })
    }

    async fn list_processes(&self) -> Vec<ProcessInfo> {
        let table = Arc::clone(&self.table);
        match tokio::task::spawn_blocking(move || table.list()).await {
            Ok(Ok(processes)) => processes,
            Ok(Err(e)) => {
                warn!("⚠️ 读取进程表失败: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("⚠️ 读取进程表任务失败: {}", e);
                Vec::new()
            }
        }
    }

    fn backfill_pids(&self, processes: &[ProcessInfo], handles: &[WorkerHandle]) {
        for handle in handles.iter().filter(|h| h.pid.is_none()) {
            let marker = handle.marker();
            let owned: HashSet<u32> = processes
                .iter()
                .filter(|p| p.carries_marker(&marker))
                .map(|p| p.pid)
                .collect();
            // 根进程：父进程不带同一个标记
            if let Some(root) = processes
                .iter()
                .filter(|p| owned.contains(&p.pid) && !owned.contains(&p.ppid))
                .map(|p| p.pid)
                .min()
            {
                self.registry.set_pid(handle.batch_seq, root);
            }
        }
    }

    async fn terminate(&self, pids: &[u32], immediate: bool, report: &mut SweepReport) {
        let first = if immediate {
            KillSignal::Kill
        } else {
            KillSignal::Terminate
        };

        let mut signalled = Vec::new();
        for &pid in pids {
            match self.table.signal(pid, first) {
                KillOutcome::Signalled => signalled.push(pid),
                KillOutcome::AlreadyGone => report.already_gone += 1,
                KillOutcome::Denied => {
                    warn!(pid, "⚠️ 无权限终止进程");
                    report.denied += 1;
                }
            }
        }

        if !immediate && !signalled.is_empty() {
            tokio::time::sleep(self.settings.grace).await;
            for &pid in &signalled {
                if self.table.is_alive(pid) {
                    debug!(pid, "进程未响应 SIGTERM，发送 SIGKILL");
                    self.table.signal(pid, KillSignal::Kill);
                }
            }
        }
        report.reaped.extend(signalled);
    }

    async fn reclaim_ports(&self, processes: &[ProcessInfo], exempt: &HashSet<u32>) -> usize {
        if self.settings.stale_ports.is_empty() {
            return 0;
        }
        let table = Arc::clone(&self.table);
        let ports = self.settings.stale_ports.clone();
        let listeners = tokio::task::spawn_blocking(move || {
            ports
                .into_iter()
                .map(|port| (port, table.listening_pids(port)))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        let mut reclaimed = 0;
        for (port, pids) in listeners {
            for pid in pids {
                let is_worker = processes
                    .iter()
                    .any(|p| p.pid == pid && p.matches_any(&self.settings.patterns));
                if !is_worker || exempt.contains(&pid) {
                    continue;
                }
                if self.table.signal(pid, KillSignal::Kill) == KillOutcome::Signalled {
                    info!(pid, port, "🔌 回收被占用的端口");
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }
}

/// 带有任一标记的进程及其全部后代
pub(crate) fn tracked_pids(processes: &[ProcessInfo], markers: &[String]) -> HashSet<u32> {
    let mut tracked: HashSet<u32> = processes
        .iter()
        .filter(|p| markers.iter().any(|m| p.carries_marker(m)))
        .map(|p| p.pid)
        .collect();

    loop {
        let before = tracked.len();
        for p in processes {
            if tracked.contains(&p.ppid) {
                tracked.insert(p.pid);
            }
        }
        if tracked.len() == before {
            break;
        }
    }
    tracked
}

/// 递归删除 `dir` 下修改时间早于 `max_age` 的文件
fn remove_old_files(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            removed += remove_old_files(&path, max_age, now);
            continue;
        }
        let expired = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age > max_age);
        if expired && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}
