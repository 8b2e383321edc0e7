use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use price_fetch_runner::models::load_codes;
use price_fetch_runner::utils::logging;
use price_fetch_runner::{AppError, BrowserWorker, BrowserWorkerSettings, Config, JobRunner};

/// 配置文件路径的环境变量；未设置时只读环境变量
const CONFIG_ENV: &str = "RUNNER_CONFIG";

fn load_config() -> Result<Config> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => Config::from_toml_file(&path)
            .with_context(|| format!("无法加载配置文件: {path}"))?
            .apply_env(),
        Err(_) => Config::from_env(),
    };
    config.validate().context("配置无效")?;
    Ok(config)
}

/// 等待 SIGINT / SIGTERM
async fn wait_for_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    // 初始化日志
    logging::init(config.verbose_logging);
    logging::init_log_file(&config.output_log_file)?;

    let codes = load_codes(&config.input_file).await?;
    if codes.is_empty() {
        warn!("⚠️ 代码文件为空，无事可做");
        return Ok(());
    }

    let settings = BrowserWorkerSettings::from_config(&config)?;
    let worker = Arc::new(BrowserWorker::new(settings));
    let source = config.input_file.display().to_string();
    let log_file = config.output_log_file.clone();
    let runner = JobRunner::system(config, worker);

    // 收到信号后停止启动新批次，运行中的工作进程尽快退出
    let signalled = Arc::new(AtomicBool::new(false));
    let cancel = runner.cancellation_token();
    let flag = signalled.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("⏹ 收到停止信号，正在收尾...");
        flag.store(true, Ordering::SeqCst);
        cancel.cancel();
    });

    let result = runner.run(&source, &codes).await;

    if signalled.load(Ordering::SeqCst) {
        let sweep = runner.shutdown_sweep().await;
        info!("🧹 退出清理: 终止 {} 个进程", sweep.reaped.len());
    }

    let report = match result {
        Ok(report) => report,
        Err(AppError::Halted { reason, report }) => {
            error!("🚨 任务中止: {}", reason);
            logging::print_final_stats(&report, &log_file);
            logging::append_summary(&log_file, &report)?;
            return Err(AppError::Resource(reason).into());
        }
        Err(e) => return Err(e.into()),
    };

    logging::print_final_stats(&report, &log_file);
    logging::append_summary(&log_file, &report)?;

    if !report.is_success() {
        anyhow::bail!("没有任何批次成功");
    }
    Ok(())
}
