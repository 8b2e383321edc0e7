//! 业务能力层（Services Layer）
//!
//! 每个服务只回答一个问题，不持有浏览器，也不编排流程：
//!
//! - `admission_gate` - 现在能不能再启动一个工作进程
//! - `process_reaper` - 哪些外部进程应该被清理
//! - `checkpoint_manager` - 进度快照的原子读写与恢复决定
//! - `artifact_publisher` - 产出文件的唯一命名与移动
//! - `artifact_verifier` - 产出文件内容的重复检查

pub mod admission_gate;
pub mod artifact_publisher;
pub mod artifact_verifier;
pub mod checkpoint_manager;
pub mod process_reaper;

pub use admission_gate::{AdmissionDecision, AdmissionGate, AdmissionThresholds};
pub use artifact_publisher::ArtifactPublisher;
pub use artifact_verifier::{ArtifactVerifier, DuplicateGroup, VerificationReport};
pub use checkpoint_manager::{CheckpointManager, ResumeDecision};
pub use process_reaper::{ProcessReaper, ReaperSettings, SweepKind, SweepReport};
