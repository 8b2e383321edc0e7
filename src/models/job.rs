//! 任务与批次
//!
//! 一个 `Job` 是对一组输入代码的完整处理过程，按固定大小切分成有序的
//! `Batch`。切分保持输入顺序，同一个代码不会出现在两个批次里。

use std::collections::HashSet;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::artifact::Artifact;
use crate::models::attempt::Attempt;
use crate::models::checkpoint::Checkpoint;

/// 批次生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// 等待调度
    Pending,
    /// 工作进程运行中
    Running,
    /// 成功，已有产出文件
    Succeeded,
    /// 本轮被中断（停止信号或任务中止），下次恢复时重新执行
    Failed,
    /// 重试耗尽或致命错误，已放弃
    Abandoned,
}

impl BatchState {
    /// 是否已到达终态
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::Abandoned)
    }
}

/// 输入身份：用于判断检查点是否属于当前输入
///
/// 检查点按批次序号记录产出文件，所以批次大小也是身份的一部分：
/// 批次大小变了，同一个序号对应的就是另一组代码。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputIdentity {
    /// 输入来源（通常是文件路径）
    pub source: String,
    /// 有序代码列表的 SHA-256
    pub digest: String,
    /// 切分批次时使用的大小；旧检查点没有这个字段，读出来是 0，不会匹配
    #[serde(default)]
    pub batch_size: usize,
}

impl InputIdentity {
    pub fn from_codes(source: impl Into<String>, codes: &[String], batch_size: usize) -> Self {
        let mut hasher = Sha256::new();
        for (i, code) in codes.iter().enumerate() {
            if i > 0 {
                hasher.update(b"\n");
            }
            hasher.update(code.as_bytes());
        }
        Self {
            source: source.into(),
            digest: hex::encode(hasher.finalize()),
            batch_size: batch_size.max(1),
        }
    }
}

/// 批次
#[derive(Debug, Clone)]
pub struct Batch {
    /// 序号（从 1 开始，用于识别和产出文件命名）
    pub seq: u32,
    pub codes: Vec<String>,
    pub state: BatchState,
    pub attempts: Vec<Attempt>,
    pub artifact: Option<Artifact>,
    /// 放弃原因
    pub failure: Option<String>,
}

impl Batch {
    pub fn new(seq: u32, codes: Vec<String>) -> Self {
        Self {
            seq,
            codes,
            state: BatchState::Pending,
            attempts: Vec::new(),
            artifact: None,
            failure: None,
        }
    }

    /// 标记成功；没有产出文件的批次不能进入 Succeeded
    pub fn succeed(&mut self, artifact: Artifact) {
        debug_assert_eq!(artifact.batch_seq, self.seq);
        self.artifact = Some(artifact);
        self.failure = None;
        self.state = BatchState::Succeeded;
    }

    pub fn abandon(&mut self, reason: impl Into<String>) {
        self.artifact = None;
        self.failure = Some(reason.into());
        self.state = BatchState::Abandoned;
    }
}

/// 按固定大小切分代码，先去重（保留第一次出现的位置）
pub fn split_into_batches(codes: &[String], batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut seen = HashSet::with_capacity(codes.len());
    let unique: Vec<String> = codes
        .iter()
        .filter(|code| seen.insert(code.as_str()))
        .cloned()
        .collect();

    unique
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| Batch::new(i as u32 + 1, chunk.to_vec()))
        .collect()
}

/// 任务
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub identity: InputIdentity,
    pub batches: Vec<Batch>,
    pub created_at: DateTime<Local>,
    pub completed: bool,
}

impl Job {
    pub fn new(source: impl Into<String>, codes: &[String], batch_size: usize) -> Self {
        let identity = InputIdentity::from_codes(source, codes, batch_size);
        let created_at = Local::now();
        let id = format!(
            "job-{}-{}",
            created_at.format("%Y%m%d%H%M%S"),
            &identity.digest[..8]
        );
        Self {
            id,
            identity,
            batches: split_into_batches(codes, batch_size),
            created_at,
            completed: false,
        }
    }

    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batch(&self, seq: u32) -> Option<&Batch> {
        self.batches.get((seq as usize).checked_sub(1)?)
    }

    pub fn batch_mut(&mut self, seq: u32) -> Option<&mut Batch> {
        self.batches.get_mut((seq as usize).checked_sub(1)?)
    }

    /// 尚未到达终态的批次（按序号排列）
    pub fn pending_batches(&self) -> Vec<Batch> {
        self.batches
            .iter()
            .filter(|b| !b.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn succeeded_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.state == BatchState::Succeeded)
            .count()
    }

    /// 已到达终态（成功或放弃）的批次数量
    pub fn terminal_count(&self) -> usize {
        self.batches.iter().filter(|b| b.state.is_terminal()).count()
    }

    /// 成功批次累计处理的代码数量
    pub fn processed_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.state == BatchState::Succeeded)
            .map(|b| b.codes.len())
            .sum()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.batches
            .iter()
            .filter_map(|b| b.artifact.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.batches.iter().all(|b| b.state.is_terminal())
    }

    /// 从检查点恢复已成功的批次；产出文件已丢失的批次会重新执行
    ///
    /// 返回恢复的批次数量。
    pub fn restore_from(&mut self, checkpoint: &Checkpoint) -> usize {
        let mut restored = 0;
        for artifact in &checkpoint.artifacts {
            if !artifact.path.exists() {
                tracing::warn!(
                    "[批次 {}] 检查点记录的文件已不存在，将重新执行: {}",
                    artifact.batch_seq,
                    artifact.path.display()
                );
                continue;
            }
            if let Some(batch) = self.batch_mut(artifact.batch_seq) {
                batch.succeed(artifact.clone());
                restored += 1;
            }
        }
        restored
    }

    /// 生成当前进度的检查点
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: Checkpoint::VERSION.to_string(),
            job_id: self.id.clone(),
            identity: self.identity.clone(),
            total_batches: self.total_batches(),
            completed_batches: self.succeeded_count(),
            processed_count: self.processed_count(),
            artifacts: self.artifacts(),
            abandoned_batches: self
                .batches
                .iter()
                .filter(|b| b.state == BatchState::Abandoned)
                .map(|b| b.seq)
                .collect(),
            completed: self.all_terminal(),
            timestamp: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{:013}", i)).collect()
    }

    #[test]
    fn test_split_25_codes_into_10_10_5() {
        let batches = split_into_batches(&codes(25), 10);
        let sizes: Vec<usize> = batches.iter().map(|b| b.codes.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let seqs: Vec<u32> = batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_split_is_a_partition() {
        let mut input = codes(37);
        input.push(input[3].clone());
        input.push(input[20].clone());

        let batches = split_into_batches(&input, 8);
        let flattened: Vec<String> = batches.iter().flat_map(|b| b.codes.clone()).collect();

        let unique: HashSet<&String> = flattened.iter().collect();
        assert_eq!(unique.len(), flattened.len(), "同一个代码出现在多个批次中");

        let input_set: HashSet<&String> = input.iter().collect();
        assert_eq!(unique, input_set);
        // 顺序保持
        assert_eq!(flattened, codes(37));
    }

    #[test]
    fn test_split_empty_input() {
        assert!(split_into_batches(&[], 10).is_empty());
    }

    #[test]
    fn test_identity_depends_on_order() {
        let a = InputIdentity::from_codes("in.txt", &["1".to_string(), "2".to_string()], 10);
        let b = InputIdentity::from_codes("in.txt", &["2".to_string(), "1".to_string()], 10);
        let c = InputIdentity::from_codes("in.txt", &["1".to_string(), "2".to_string()], 10);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn test_identity_depends_on_batch_size() {
        let ten = Job::new("in.txt", &codes(20), 10);
        let five = Job::new("in.txt", &codes(20), 5);
        assert_eq!(ten.identity.digest, five.identity.digest);
        assert_ne!(ten.identity, five.identity);
        assert_eq!(five.identity.batch_size, 5);
    }

    #[test]
    fn test_identity_without_batch_size_never_matches() {
        let job = Job::new("in.txt", &codes(3), 10);
        let mut json = serde_json::to_value(&job.identity).unwrap();
        json.as_object_mut().unwrap().remove("batch_size");
        let old: InputIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(old.batch_size, 0);
        assert_ne!(old, job.identity);
    }

    #[test]
    fn test_checkpoint_reflects_progress() {
        let mut job = Job::new("in.txt", &codes(25), 10);
        job.batch_mut(1)
            .unwrap()
            .succeed(Artifact::new(1, "a.xlsx".into(), 10));
        job.batch_mut(2).unwrap().abandon("致命错误");

        assert_eq!(job.succeeded_count(), 1);
        assert_eq!(job.terminal_count(), 2);

        let cp = job.checkpoint();
        assert_eq!(cp.total_batches, 3);
        assert_eq!(cp.completed_batches, 1);
        assert_eq!(cp.processed_count, 10);
        assert_eq!(cp.abandoned_batches, vec![2]);
        assert!(!cp.completed);

        job.batch_mut(3)
            .unwrap()
            .succeed(Artifact::new(3, "c.xlsx".into(), 10));
        assert!(job.checkpoint().completed);
    }

    #[test]
    fn test_batch_lookup_by_seq() {
        let job = Job::new("in.txt", &codes(5), 2);
        assert_eq!(job.batch(1).unwrap().codes.len(), 2);
        assert_eq!(job.batch(3).unwrap().codes.len(), 1);
        assert!(job.batch(0).is_none());
        assert!(job.batch(4).is_none());
    }
}
