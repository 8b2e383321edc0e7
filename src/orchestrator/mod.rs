//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `job_runner` - 任务执行器
//! - 管理一次任务的生命周期（启动清理、恢复、调度、收尾）
//! - 持有进程登记表、清理器和检查点管理器
//! - 消费调度事件，更新批次状态，按间隔保存检查点
//! - 汇总任务报告
//!
//! ### `scheduler` - 工作槽调度器
//! - 独立模式：一次提交全部批次，信号量控制并发
//! - 窗口模式：整窗结束后再开始下一窗
//! - 单批次任务直接运行
//!
//! ## 层次关系
//!
//! ```text
//! job_runner (处理 Job)
//!     ↓
//! scheduler (分发 Vec<Batch>)
//!     ↓
//! workflow::BatchFlow (处理单个 Batch)
//!     ↓
//! services (能力层：gate / reaper / checkpoint / publisher / verifier)
//!     ↓
//! infrastructure (基础设施：ProcessTable / ResourceProbe / JsExecutor)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：job_runner 管任务，scheduler 管并发
//! 2. **资源隔离**：只有编排层持有登记表和清理器
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **无业务逻辑**：只做调度和统计，不接触页面

pub mod job_runner;
pub mod scheduler;

// 重新导出主要类型
pub use job_runner::{AbandonedBatch, JobReport, JobRunner, ProgressSink, StopFlag};
pub use scheduler::{DispatchEvent, Scheduler};
