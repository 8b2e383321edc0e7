use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// 启动参数
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// 独占的用户数据目录，同时作为进程归属标记出现在命令行里
    pub profile_dir: PathBuf,
    pub download_dir: PathBuf,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
}

/// 一个独立的浏览器实例
///
/// 每次尝试启动一个新的实例，不与其他批次共享任何页面或缓存。
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    /// 打开新页面
    pub async fn new_page(&self, url: &str) -> Result<Page, WorkerError> {
        let page = self.browser.new_page(url).await.map_err(|e| {
            error!("创建页面失败: {}", e);
            WorkerError::from(e)
        })?;
        Ok(page)
    }

    /// 关闭浏览器
    ///
    /// 先请求正常关闭，超时后强制结束子进程。清理器会兜底处理残留。
    pub async fn shutdown(mut self) {
        match timeout(CLOSE_TIMEOUT, self.browser.close()).await {
            Ok(Ok(_)) => debug!("浏览器已关闭"),
            Ok(Err(e)) => debug!("关闭浏览器失败: {}", e),
            Err(_) => warn!("⚠️ 关闭浏览器超时，强制结束"),
        }
        if let Some(Err(e)) = self.browser.kill().await {
            debug!("结束浏览器进程失败: {}", e);
        }
        if timeout(CLOSE_TIMEOUT, self.browser.wait()).await.is_err() {
            debug!("等待浏览器进程退出超时");
        }
        self.handler.abort();
    }
}

/// 启动一个隔离的浏览器实例，并把下载目录指向工作目录
pub async fn launch_isolated_browser(options: &LaunchOptions) -> Result<BrowserSession, WorkerError> {
    info!("🚀 启动浏览器实例...");
    debug!("用户数据目录: {}", options.profile_dir.display());

    let mut builder = BrowserConfig::builder()
        .user_data_dir(&options.profile_dir)
        .args(vec![
            "--disable-gpu",
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-extensions",
        ]);
    builder = if options.headless {
        builder.new_headless_mode()
    } else {
        builder.with_head()
    };
    if let Some(exe) = &options.chrome_executable {
        builder = builder.chrome_executable(exe);
    }
    // 找不到浏览器可执行文件之类的配置问题重试也没用
    let config = builder.build().map_err(|e| {
        error!("配置浏览器失败: {}", e);
        WorkerError::fatal(format!("配置浏览器失败: {e}"))
    })?;

    let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
        error!("启动浏览器失败: {}", e);
        WorkerError::from(e)
    })?;

    // 在后台处理浏览器事件
    let handler = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 添加短暂延迟以等待浏览器状态同步
    sleep(Duration::from_millis(300)).await;

    let session = BrowserSession { browser, handler };
    if let Err(e) = allow_downloads(&session.browser, &options.download_dir).await {
        session.shutdown().await;
        return Err(e);
    }

    info!("✅ 浏览器实例已就绪");
    Ok(session)
}

async fn allow_downloads(browser: &Browser, download_dir: &Path) -> Result<(), WorkerError> {
    let params = SetDownloadBehaviorParams::builder()
        .behavior(SetDownloadBehaviorBehavior::Allow)
        .download_path(download_dir.to_string_lossy().to_string())
        .build()
        .map_err(|e| WorkerError::fatal(format!("下载参数无效: {e}")))?;
    browser.execute(params).await?;
    debug!("下载目录: {}", download_dir.display());
    Ok(())
}
