//! # Price Fetch Runner
//!
//! 用无头浏览器批量抓取商品价格的任务编排器：负责切分批次、控制并发、
//! 准入检查、失败重试、清理残留进程、保存检查点和校验产出文件。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源，只暴露能力
//! - `ProcessTable` - 系统进程的枚举和终止
//! - `ResourceProbe` - 内存 / CPU / 磁盘 / 进程数采样，带超时
//! - `JsExecutor` - 唯一的 page owner，提供 eval() 能力
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不做流程决策
//! - `AdmissionGate` - 根据资源采样决定能否启动、建议并发数
//! - `ProcessReaper` - 分级清理残留浏览器进程、端口和临时文件
//! - `CheckpointManager` - 原子保存 / 加载检查点
//! - `ArtifactPublisher` - 把下载文件以唯一文件名移入输出目录
//! - `ArtifactVerifier` - 产出文件内容哈希查重
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个批次"的完整处理流程
//! - `BatchCtx` - 上下文封装（job_id + 批次序号）
//! - `BatchFlow` - 准入 → 启动 → 等待 → 发布，失败按策略重试
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/scheduler` - 工作槽调度，独立模式 / 窗口模式
//! - `orchestrator/job_runner` - 任务生命周期：恢复、调度、检查点、校验、报告
//!
//! 另外：`worker/` 定义工作进程契约和基于浏览器的实现，
//! `browser/` 负责启动隔离的浏览器实例和等待下载。
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod worker;
pub mod workflow;

// 重新导出常用类型
pub use config::{Config, DispatchMode};
pub use error::{AppError, AppResult, ResourceError, WorkerError, WorkerErrorKind};
pub use infrastructure::{JsExecutor, ProcFsTable, ProcessTable, ResourceProbe, SystemProbe};
pub use models::{Artifact, Batch, BatchState, Checkpoint, Job, ResourceSample, WorkerHandle};
pub use orchestrator::{JobReport, JobRunner};
pub use worker::{BrowserWorker, BrowserWorkerSettings, Worker, Workspace};
pub use workflow::{BatchCtx, BatchFlow, RetryPolicy};
