//! 产出文件校验 - 业务能力层
//!
//! 所有批次结束后，对每个产出文件计算内容哈希。内容完全相同的文件
//! 往往说明某个工作进程复用了旧的页面状态，这里只报告，不删除也不修改
//! 任何文件：自动删除可能毁掉唯一一份有效数据。

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::models::Artifact;

/// 内容相同的一组产出文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub content_hash: String,
    pub batch_seqs: Vec<u32>,
    pub paths: Vec<PathBuf>,
}

/// 校验结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// 已计算哈希的产出文件
    pub hashed: Vec<Artifact>,
    pub duplicates: Vec<DuplicateGroup>,
    /// 找不到或读不了的文件
    pub missing: Vec<Artifact>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty()
    }

    /// 被怀疑重复的批次（升序）
    pub fn suspected_batches(&self) -> Vec<u32> {
        let mut seqs: Vec<u32> = self
            .duplicates
            .iter()
            .flat_map(|g| g.batch_seqs.iter().copied())
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        seqs
    }
}

/// 流式计算文件的 SHA-256
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 产出文件校验器
#[derive(Debug, Clone, Default)]
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    pub fn new() -> Self {
        Self
    }

    pub async fn verify(&self, artifacts: &[Artifact]) -> VerificationReport {
        let artifacts = artifacts.to_vec();
        match tokio::task::spawn_blocking(move || Self::verify_blocking(artifacts)).await {
            Ok(report) => report,
            Err(e) => {
                warn!("⚠️ 产出文件校验任务失败: {}", e);
                VerificationReport::default()
            }
        }
    }

    fn verify_blocking(artifacts: Vec<Artifact>) -> VerificationReport {
        info!("🔍 检查 {} 个产出文件的内容唯一性...", artifacts.len());
        let mut report = VerificationReport::default();

        for mut artifact in artifacts {
            match hash_file(&artifact.path) {
                Ok(hash) => {
                    artifact.content_hash = Some(hash);
                    report.hashed.push(artifact);
                }
                Err(e) => {
                    warn!(
                        "[批次 {}] ❌ 无法读取产出文件 {}: {}",
                        artifact.batch_seq,
                        artifact.path.display(),
                        e
                    );
                    report.missing.push(artifact);
                }
            }
        }

        let mut by_hash: BTreeMap<&str, Vec<&Artifact>> = BTreeMap::new();
        for artifact in &report.hashed {
            if let Some(hash) = artifact.content_hash.as_deref() {
                by_hash.entry(hash).or_default().push(artifact);
            }
        }

        let duplicates: Vec<DuplicateGroup> = by_hash
            .into_iter()
            .filter(|(_, group)| group.len() > 1)
            .map(|(hash, group)| DuplicateGroup {
                content_hash: hash.to_string(),
                batch_seqs: group.iter().map(|a| a.batch_seq).collect(),
                paths: group.iter().map(|a| a.path.clone()).collect(),
            })
            .collect();

        for group in &duplicates {
            warn!(
                "🚨 发现内容相同的产出文件: 批次 {:?} ({})",
                group.batch_seqs,
                &group.content_hash[..12]
            );
        }
        if duplicates.is_empty() {
            info!("✅ 所有产出文件内容唯一");
        }

        report.duplicates = duplicates;
        report
    }
}
