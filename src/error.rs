use std::fmt;

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 工作进程返回的错误
    #[error("工作进程错误: {0}")]
    Worker(#[from] WorkerError),
    /// 资源治理错误（进程泄漏、探针失效）
    #[error("资源错误: {0}")]
    Resource(#[from] ResourceError),
    /// 检查点持久化错误
    #[error("检查点错误: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 任务因资源灾难被强制中止，附带中止时的部分报告
    #[error("任务已中止: {reason}")]
    Halted {
        reason: ResourceError,
        report: Box<crate::orchestrator::JobReport>,
    },
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 工作进程错误分类
///
/// 编排层只认识这三类错误，具体的页面交互细节对它不可见。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerErrorKind {
    /// 超时、连接重置、远端临时错误：退避后重试
    Retryable,
    /// 启动时内存/CPU 不足：等待准入闸门复查，不计入尝试次数
    ResourceExhausted,
    /// 结构性错误（控件始终找不到、批次归一化后为空）：立即放弃
    Fatal,
}

impl fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErrorKind::Retryable => write!(f, "可重试"),
            WorkerErrorKind::ResourceExhausted => write!(f, "资源不足"),
            WorkerErrorKind::Fatal => write!(f, "致命"),
        }
    }
}

/// 工作进程错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[{kind}] {message}")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
}

static RETRYABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connection|timeout|timed out|network|unreachable|refused|disconnected|reset")
        .expect("静态正则表达式")
});

static EXHAUSTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)out of memory|cannot allocate|resource temporarily unavailable|no space left")
        .expect("静态正则表达式")
});

impl WorkerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::ResourceExhausted,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// 根据错误文本推断错误类别
    ///
    /// 资源耗尽类关键字优先；其余一律视为可重试。结构性错误只能由
    /// 工作进程显式报告，不会从文本里猜出来。
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if EXHAUSTION_PATTERN.is_match(&message) {
            Self::resource_exhausted(message)
        } else if RETRYABLE_PATTERN.is_match(&message) {
            Self::retryable(message)
        } else {
            Self::retryable(format!("未知错误: {}", message))
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == WorkerErrorKind::Fatal
    }
}

/// 资源治理错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// 外部进程数量达到灾难阈值，拒绝启动新的工作进程
    #[error("外部进程数量 {count} 超过灾难阈值 {limit}，拒绝启动新的工作进程")]
    CatastrophicProcessCount { count: usize, limit: usize },
    /// 资源采样超时
    #[error("资源采样超时 ({timeout_ms} ms)")]
    ProbeTimeout { timeout_ms: u64 },
    /// 资源采样失败
    #[error("资源采样失败: {reason}")]
    ProbeFailed { reason: String },
}

/// 检查点错误
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// 写入临时文件失败
    #[error("写入检查点失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 原子替换失败
    #[error("替换检查点文件失败 ({path}): {source}")]
    RenameFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 读取失败
    #[error("读取检查点失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析/序列化失败
    #[error("检查点 JSON 处理失败 ({path}): {source}")]
    JsonFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 移动文件失败
    #[error("移动文件失败 ({from} -> {to}): {source}")]
    MoveFailed {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: String, reason: String },
    /// TOML 解析失败
    #[error("TOML 解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ========== 从常见错误类型转换 ==========

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(ConfigError::TomlParseFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Checkpoint(CheckpointError::JsonFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<chromiumoxide::error::CdpError> for WorkerError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        WorkerError::classify(err.to_string())
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建配置值错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// 创建文件读取错误
    pub fn file_read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source,
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
