use anyhow::Result;
/// 日志工具模块
///
/// 提供日志初始化、格式化输出和运行摘要文件的辅助函数
use std::fs;
use std::io::Write;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::JobReport;

/// 初始化 tracing 日志
///
/// 优先使用 `RUST_LOG`，否则默认 `info`（详细模式为 `debug`）。
/// 重复调用不会报错。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化运行摘要文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n价格抓取运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 多进程批量抓取模式");
    info!("📊 最大并发数: {}", config.max_parallel_workers);
    info!("📦 每批代码数: {}", config.batch_size);
    info!(
        "🛡️ 准入阈值: 内存 ≥ {}MB, CPU ≤ {}%, 外部进程 ≤ {}",
        config.min_free_memory_mb, config.max_cpu_percent, config.max_tracked_processes
    );
    info!("{}", "=".repeat(60));
}

/// 记录任务切分信息
///
/// # 参数
/// - `total_codes`: 去重后的代码总数
/// - `total_batches`: 批次总数
/// - `pending`: 本次需要运行的批次数
pub fn log_job_plan(total_codes: usize, total_batches: usize, pending: usize) {
    info!("✓ 共 {} 个代码，切分为 {} 个批次", total_codes, total_batches);
    if pending < total_batches {
        info!(
            "📂 {} 个批次已在之前完成，本次处理 {} 个\n",
            total_batches - pending,
            pending
        );
    } else {
        info!("📋 本次处理全部 {} 个批次\n", pending);
    }
}

/// 记录窗口开始信息
pub fn log_window_start(window: usize, total_windows: usize, first_seq: u32, last_seq: u32) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 窗", window, total_windows);
    info!("📄 本窗批次: {}-{}", first_seq, last_seq);
    info!("{}", "=".repeat(60));
}

/// 记录窗口完成信息
pub fn log_window_complete(window: usize, settled: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!("✓ 第 {} 窗结束: {}/{} 个批次已返回", window, settled, total);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `report`: 任务报告
/// - `log_file_path`: 摘要文件路径
pub fn print_final_stats(report: &JobReport, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", report.succeeded.len(), report.total_batches);
    info!("❌ 放弃: {}", report.abandoned.len());
    for abandoned in &report.abandoned {
        info!("   - 批次 {}: {}", abandoned.seq, truncate_text(&abandoned.reason, 80));
    }
    if !report.unfinished.is_empty() {
        info!("⏸ 未完成: {:?}", report.unfinished);
    }
    if !report.duplicates.is_empty() {
        info!("🚨 疑似重复: {:?}", report.suspected_duplicate_batches());
    }
    info!("🔢 已处理代码: {}", report.processed_codes);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 把任务摘要追加到摘要文件
pub fn append_summary(log_file_path: &str, report: &JobReport) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)?;

    writeln!(file, "任务: {}", report.job_id)?;
    writeln!(file, "输入: {} ({})", report.identity.source, report.identity.digest)?;
    writeln!(
        file,
        "批次: 共 {} / 成功 {} / 放弃 {} / 未完成 {}",
        report.total_batches,
        report.succeeded.len(),
        report.abandoned.len(),
        report.unfinished.len()
    )?;
    writeln!(file, "已处理代码: {}", report.processed_codes)?;
    for artifact in &report.succeeded {
        writeln!(file, "  [批次 {}] {}", artifact.batch_seq, artifact.path.display())?;
    }
    for abandoned in &report.abandoned {
        writeln!(file, "  [批次 {}] 放弃: {}", abandoned.seq, abandoned.reason)?;
    }
    for group in &report.duplicates {
        writeln!(file, "  疑似重复: 批次 {:?}", group.batch_seqs)?;
    }
    if report.cancelled {
        writeln!(file, "  (运行被中断)")?;
    }
    writeln!(
        file,
        "结束时间: {}\n{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    )?;
    Ok(())
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
