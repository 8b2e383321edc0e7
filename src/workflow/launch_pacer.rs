//! 启动节流：相邻两次启动之间至少间隔 `spacing`，避免同时拉起大量浏览器

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct LaunchPacer {
    spacing: Duration,
    last_launch: Mutex<Option<Instant>>,
}

impl LaunchPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_launch: Mutex::new(None),
        }
    }

    /// 等到轮到自己启动
    pub async fn wait_turn(&self) {
        let mut last = self.last_launch.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.spacing).await;
        }
        *last = Some(Instant::now());
    }
}
