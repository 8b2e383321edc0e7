//! JS 执行器 - 基础设施层
//!
//! 持有工作进程唯一的 page 资源，只暴露"导航"和"执行 JS"的能力

use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::WorkerError;

/// JS 执行器
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 暴露 navigate() / eval() 能力
/// - 不认识批次和代码
pub struct JsExecutor {
    page: Page,
}

impl JsExecutor {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 导航到指定 URL 并等待页面加载
    pub async fn navigate(&self, url: &str) -> Result<(), WorkerError> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> Result<JsonValue, WorkerError> {
        let result = self.page.evaluate(js_code.into()).await?;
        result
            .into_value()
            .map_err(|e| WorkerError::retryable(format!("脚本返回值无法解析: {e}")))
    }

    /// 执行 JS 代码并反序列化为指定类型
    ///
    /// 返回值形状不符合预期属于脚本与页面不匹配，按结构性错误处理。
    pub async fn eval_as<T: DeserializeOwned>(
        &self,
        js_code: impl Into<String>,
    ) -> Result<T, WorkerError> {
        let json_value = self.eval(js_code).await?;
        serde_json::from_value(json_value)
            .map_err(|e| WorkerError::fatal(format!("脚本返回值结构不符: {e}")))
    }
}
