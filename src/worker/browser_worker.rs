//! 基于 chromiumoxide 的工作进程实现
//!
//! 每次调用启动一个独立的浏览器实例，页面交互交给一段导出脚本：
//! 脚本里的 `{{codes}}` 会被替换为本批代码的 JSON 数组，脚本需要返回
//! `{ "status": "ok" | "retry" | "resource" | "structural", "message": "..." }`。
//! 返回 `ok` 之后等待下载目录出现完整文件。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{launch_isolated_browser, wait_for_download, LaunchOptions};
use crate::config::Config;
use crate::error::{AppError, AppResult, WorkerError};
use crate::infrastructure::JsExecutor;
use crate::worker::{normalize_batch, Worker, Workspace};

const CODES_PLACEHOLDER: &str = "{{codes}}";

/// 浏览器工作进程配置
#[derive(Debug, Clone)]
pub struct BrowserWorkerSettings {
    pub target_url: String,
    pub script_template: String,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub download_timeout: Duration,
    pub download_poll: Duration,
    pub code_width: usize,
}

impl BrowserWorkerSettings {
    /// 从配置构建，读取导出脚本模板
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let script_template = std::fs::read_to_string(&config.export_script).map_err(|e| {
            AppError::file_read_failed(config.export_script.display().to_string(), e)
        })?;
        if !script_template.contains(CODES_PLACEHOLDER) {
            return Err(AppError::invalid_config(
                "export_script",
                format!("脚本中缺少 {CODES_PLACEHOLDER} 占位符"),
            ));
        }
        Ok(Self {
            target_url: config.target_url.clone(),
            script_template,
            headless: config.headless,
            chrome_executable: config.chrome_executable.clone(),
            download_timeout: Duration::from_secs(config.download_timeout_sec),
            download_poll: Duration::from_millis(config.download_poll_ms.max(1)),
            code_width: config.code_width,
        })
    }

    /// 把代码填入脚本模板
    pub fn render_script(&self, codes: &[String]) -> String {
        let json = serde_json::to_string(codes).unwrap_or_else(|_| "[]".to_string());
        self.script_template.replace(CODES_PLACEHOLDER, &json)
    }
}

/// 导出脚本的返回值
#[derive(Debug, Deserialize)]
struct ScriptResult {
    status: String,
    #[serde(default)]
    message: String,
}

impl ScriptResult {
    fn into_result(self) -> Result<(), WorkerError> {
        match self.status.as_str() {
            "ok" => Ok(()),
            "retry" => Err(WorkerError::retryable(self.message)),
            "resource" => Err(WorkerError::resource_exhausted(self.message)),
            "structural" => Err(WorkerError::fatal(self.message)),
            other => Err(WorkerError::fatal(format!(
                "未知的脚本状态 {other}: {}",
                self.message
            ))),
        }
    }
}

/// 浏览器工作进程
pub struct BrowserWorker {
    settings: BrowserWorkerSettings,
}

impl BrowserWorker {
    pub fn new(settings: BrowserWorkerSettings) -> Self {
        Self { settings }
    }

    async fn export(
        &self,
        codes: &[String],
        workspace: &Workspace,
        stop: &CancellationToken,
    ) -> Result<PathBuf, WorkerError> {
        let options = LaunchOptions {
            profile_dir: workspace.profile_dir.clone(),
            download_dir: workspace.output_dir.clone(),
            headless: self.settings.headless,
            chrome_executable: self.settings.chrome_executable.clone(),
        };
        let session = launch_isolated_browser(&options).await?;

        let result = async {
            let page = session.new_page("about:blank").await?;
            let executor = JsExecutor::new(page);
            executor.navigate(&self.settings.target_url).await?;

            let script = self.settings.render_script(codes);
            let outcome: ScriptResult = executor.eval_as(script).await?;
            debug!("导出脚本返回: {} {}", outcome.status, outcome.message);
            outcome.into_result()?;

            wait_for_download(
                &workspace.output_dir,
                self.settings.download_timeout,
                self.settings.download_poll,
                stop,
            )
            .await
        }
        .await;

        session.shutdown().await;
        result
    }
}

#[async_trait]
impl Worker for BrowserWorker {
    async fn run_batch(
        &self,
        codes: &[String],
        workspace: &Workspace,
        stop: &CancellationToken,
    ) -> Result<PathBuf, WorkerError> {
        let normalized = normalize_batch(codes, self.settings.code_width);
        if normalized.is_empty() {
            return Err(WorkerError::fatal("规范化后没有有效代码"));
        }
        if normalized.len() < codes.len() {
            warn!("⚠️ {} 个代码规范化后被丢弃", codes.len() - normalized.len());
        }

        let started = Instant::now();
        let path = self.export(&normalized, workspace, stop).await?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "✅ 下载完成: {}",
            path.display()
        );
        Ok(path)
    }
}
