//! 流程层（Workflow Layer）
//!
//! 定义"一个批次"的完整处理流程：准入 → 启动 → 重试 → 清理。

pub mod batch_ctx;
pub mod batch_flow;
pub mod launch_pacer;
pub mod retry_policy;

pub use batch_ctx::BatchCtx;
pub use batch_flow::{BatchFlow, BatchOutcome, BatchReport};
pub use launch_pacer::LaunchPacer;
pub use retry_policy::{RetryDecision, RetryPolicy};
