//! 基础设施层（Infrastructure Layer）
//!
//! 持有稀缺资源，只暴露能力：
//!
//! - `process_table` - 系统进程的列出、发信号、端口归属
//! - `telemetry` - 有时限的主机资源采样
//! - `js_executor` - 唯一的 page owner，提供 eval() 能力

pub mod js_executor;
pub mod process_table;
pub mod telemetry;

pub use js_executor::JsExecutor;
pub use process_table::{KillOutcome, KillSignal, ProcFsTable, ProcessInfo, ProcessTable};
pub use telemetry::{ResourceProbe, SystemProbe};
