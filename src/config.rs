use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult, ConfigError};
use crate::services::admission_gate::AdmissionThresholds;
use crate::services::process_reaper::ReaperSettings;
use crate::workflow::RetryPolicy;

/// 调度策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// 所有批次一次性提交，由计数信号量控制并发，互不等待
    #[default]
    Independent,
    /// 按窗口分组，整窗结束后再开始下一窗（降级策略）
    Windowed,
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "independent" => Ok(DispatchMode::Independent),
            "windowed" => Ok(DispatchMode::Windowed),
            other => Err(ConfigError::InvalidValue {
                field: "dispatch_mode".to_string(),
                reason: format!("未知的调度策略: {}", other),
            }),
        }
    }
}

/// 程序配置
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // --- 并发与批次 ---
    /// 同时运行的工作进程上限
    pub max_parallel_workers: usize,
    /// 每个批次的代码数量
    pub batch_size: usize,
    /// 调度策略
    pub dispatch_mode: DispatchMode,
    /// 相邻两次启动之间的间隔（秒）
    pub worker_start_delay_sec: f64,

    // --- 准入阈值 ---
    pub min_free_memory_mb: u64,
    pub max_cpu_percent: u32,
    /// 超过该数量触发紧急清理
    pub max_tracked_processes: usize,
    /// 超过该数量拒绝启动并返回致命错误
    pub catastrophic_process_count: usize,
    /// 准入被拒绝后的冷却时间（秒）
    pub admission_cooldown_sec: f64,
    /// 资源不足时的复查次数上限（不计入尝试次数）
    pub admission_rechecks: u32,
    /// 资源采样的超时（秒）
    pub probe_timeout_sec: f64,

    // --- 重试 ---
    pub attempt_ceiling: u32,
    pub backoff_base_sec: f64,
    /// 单次尝试的墙钟上限（秒）
    pub worker_timeout_sec: u64,

    // --- 进程清理 ---
    pub process_max_age_sec: u64,
    pub reaper_interval_sec: u64,
    /// SIGTERM 之后等待多久再 SIGKILL（毫秒）
    pub reaper_grace_ms: u64,
    pub process_name_patterns: Vec<String>,
    pub stale_ports: Vec<u16>,
    pub temp_dir: PathBuf,
    pub temp_max_age_sec: u64,

    // --- 检查点 ---
    pub checkpoint_enabled: bool,
    pub checkpoint_interval: usize,
    pub checkpoint_path: PathBuf,
    /// 已完成的检查点是否重新执行
    pub rerun_completed: bool,

    // --- 目录 ---
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_log_file: String,

    // --- 浏览器工作进程 ---
    pub headless: bool,
    pub target_url: String,
    pub export_script: PathBuf,
    pub chrome_executable: Option<PathBuf>,
    pub download_timeout_sec: u64,
    pub download_poll_ms: u64,
    pub code_width: usize,

    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_workers: 2,
            batch_size: 500,
            dispatch_mode: DispatchMode::Independent,
            worker_start_delay_sec: 2.0,
            min_free_memory_mb: 300,
            max_cpu_percent: 75,
            max_tracked_processes: 50,
            catastrophic_process_count: 100,
            admission_cooldown_sec: 5.0,
            admission_rechecks: 3,
            probe_timeout_sec: 3.0,
            attempt_ceiling: 3,
            backoff_base_sec: 1.0,
            worker_timeout_sec: 600,
            process_max_age_sec: 20 * 60,
            reaper_interval_sec: 300,
            reaper_grace_ms: 500,
            process_name_patterns: vec![
                "chrome".to_string(),
                "chromium".to_string(),
                "chromedriver".to_string(),
            ],
            stale_ports: vec![9515, 9222, 9223, 9224, 9225],
            temp_dir: PathBuf::from("temp_files"),
            temp_max_age_sec: 30 * 60,
            checkpoint_enabled: true,
            checkpoint_interval: 5,
            checkpoint_path: PathBuf::from("processing_checkpoint.json"),
            rerun_completed: false,
            input_file: PathBuf::from("codes.txt"),
            output_dir: PathBuf::from("downloads"),
            work_dir: PathBuf::from("worker_runs"),
            output_log_file: "run_summary.txt".to_string(),
            headless: true,
            target_url: "about:blank".to_string(),
            export_script: PathBuf::from("export_script.js"),
            chrome_executable: None,
            download_timeout_sec: 120,
            download_poll_ms: 2000,
            code_width: 13,
            verbose_logging: false,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

fn env_list<T: FromStr>(name: &str, fallback: Vec<T>) -> Vec<T> {
    match std::env::var(name) {
        Ok(raw) => {
            let parsed: Option<Vec<T>> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().ok())
                .collect();
            parsed.unwrap_or(fallback)
        }
        Err(_) => fallback,
    }
}

impl Config {
    /// 从环境变量加载（未设置或无法解析的项使用默认值）
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// 从 TOML 文件加载，缺失的键使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::file_read_failed(path.display().to_string(), e))?;
        toml::from_str(&content).map_err(|source| {
            AppError::Config(ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })
        })
    }

    /// 用环境变量覆盖当前配置
    pub fn apply_env(self) -> Self {
        Self {
            max_parallel_workers: env_parse("MAX_PARALLEL_WORKERS", self.max_parallel_workers),
            batch_size: env_parse("BATCH_SIZE", self.batch_size),
            dispatch_mode: env_parse("DISPATCH_MODE", self.dispatch_mode),
            worker_start_delay_sec: env_parse("WORKER_START_DELAY_SEC", self.worker_start_delay_sec),
            min_free_memory_mb: env_parse("MIN_FREE_MEMORY_MB", self.min_free_memory_mb),
            max_cpu_percent: env_parse("MAX_CPU_PERCENT", self.max_cpu_percent),
            max_tracked_processes: env_parse("MAX_TRACKED_PROCESSES", self.max_tracked_processes),
            catastrophic_process_count: env_parse(
                "CATASTROPHIC_PROCESS_COUNT",
                self.catastrophic_process_count,
            ),
            admission_cooldown_sec: env_parse("ADMISSION_COOLDOWN_SEC", self.admission_cooldown_sec),
            admission_rechecks: env_parse("ADMISSION_RECHECKS", self.admission_rechecks),
            probe_timeout_sec: env_parse("PROBE_TIMEOUT_SEC", self.probe_timeout_sec),
            attempt_ceiling: env_parse("ATTEMPT_CEILING", self.attempt_ceiling),
            backoff_base_sec: env_parse("BACKOFF_BASE_SEC", self.backoff_base_sec),
            worker_timeout_sec: env_parse("WORKER_TIMEOUT_SEC", self.worker_timeout_sec),
            process_max_age_sec: env_parse("PROCESS_MAX_AGE_SEC", self.process_max_age_sec),
            reaper_interval_sec: env_parse("REAPER_INTERVAL_SEC", self.reaper_interval_sec),
            reaper_grace_ms: env_parse("REAPER_GRACE_MS", self.reaper_grace_ms),
            process_name_patterns: env_list("PROCESS_NAME_PATTERNS", self.process_name_patterns),
            stale_ports: env_list("STALE_PORTS", self.stale_ports),
            temp_dir: env_parse("TEMP_DIR", self.temp_dir),
            temp_max_age_sec: env_parse("TEMP_MAX_AGE_SEC", self.temp_max_age_sec),
            checkpoint_enabled: env_parse("CHECKPOINT_ENABLED", self.checkpoint_enabled),
            checkpoint_interval: env_parse("CHECKPOINT_INTERVAL", self.checkpoint_interval),
            checkpoint_path: env_parse("CHECKPOINT_PATH", self.checkpoint_path),
            rerun_completed: env_parse("RERUN_COMPLETED", self.rerun_completed),
            input_file: env_parse("INPUT_FILE", self.input_file),
            output_dir: env_parse("OUTPUT_DIR", self.output_dir),
            work_dir: env_parse("WORK_DIR", self.work_dir),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(self.output_log_file),
            headless: env_parse("HEADLESS", self.headless),
            target_url: std::env::var("TARGET_URL").unwrap_or(self.target_url),
            export_script: env_parse("EXPORT_SCRIPT", self.export_script),
            chrome_executable: std::env::var("CHROME_EXECUTABLE")
                .ok()
                .map(PathBuf::from)
                .or(self.chrome_executable),
            download_timeout_sec: env_parse("DOWNLOAD_TIMEOUT_SEC", self.download_timeout_sec),
            download_poll_ms: env_parse("DOWNLOAD_POLL_MS", self.download_poll_ms),
            code_width: env_parse("CODE_WIDTH", self.code_width),
            verbose_logging: env_parse("VERBOSE_LOGGING", self.verbose_logging),
        }
    }

    /// 校验配置的取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.max_parallel_workers == 0 {
            return Err(invalid("max_parallel_workers", "必须大于 0"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "必须大于 0"));
        }
        if self.attempt_ceiling == 0 {
            return Err(invalid("attempt_ceiling", "必须大于 0"));
        }
        if self.max_cpu_percent == 0 || self.max_cpu_percent > 100 {
            return Err(invalid("max_cpu_percent", "必须在 1..=100 之间"));
        }
        if self.catastrophic_process_count < self.max_tracked_processes {
            return Err(invalid(
                "catastrophic_process_count",
                "不能小于 max_tracked_processes",
            ));
        }
        if self.code_width == 0 {
            return Err(invalid("code_width", "必须大于 0"));
        }
        for (field, value) in [
            ("worker_start_delay_sec", self.worker_start_delay_sec),
            ("admission_cooldown_sec", self.admission_cooldown_sec),
            ("probe_timeout_sec", self.probe_timeout_sec),
            ("backoff_base_sec", self.backoff_base_sec),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, "必须是非负数"));
            }
        }
        Ok(())
    }

    pub fn worker_start_delay(&self) -> Duration {
        Duration::from_secs_f64(self.worker_start_delay_sec)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_sec)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_sec)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_sec)
    }

    /// 准入闸门的阈值
    pub fn thresholds(&self) -> AdmissionThresholds {
        AdmissionThresholds {
            min_free_memory_mb: self.min_free_memory_mb,
            max_cpu_percent: self.max_cpu_percent as f32,
            max_tracked_processes: self.max_tracked_processes,
            catastrophic_process_count: self.catastrophic_process_count,
            concurrency_ceiling: self.max_parallel_workers,
        }
    }

    /// 重试/退避策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_ceiling: self.attempt_ceiling,
            base_delay: Duration::from_secs_f64(self.backoff_base_sec),
            admission_rechecks: self.admission_rechecks,
            admission_cooldown: Duration::from_secs_f64(self.admission_cooldown_sec),
            ..RetryPolicy::default()
        }
    }

    /// 进程清理器设置
    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            patterns: self.process_name_patterns.clone(),
            max_age: Duration::from_secs(self.process_max_age_sec),
            stale_ports: self.stale_ports.clone(),
            temp_dir: self.temp_dir.clone(),
            temp_max_age: Duration::from_secs(self.temp_max_age_sec),
            grace: Duration::from_millis(self.reaper_grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.attempt_ceiling, 3);
        assert_eq!(config.process_max_age_sec, 1200);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_validate_rejects_inverted_process_limits() {
        let config = Config {
            max_tracked_processes: 80,
            catastrophic_process_count: 40,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_missing_keys_take_defaults() {
        let config: Config = toml::from_str(
            r#"
            max_parallel_workers = 4
            batch_size = 10
            dispatch_mode = "windowed"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_workers, 4);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.dispatch_mode, DispatchMode::Windowed);
        assert_eq!(config.min_free_memory_mb, 300);
    }

    #[test]
    fn test_dispatch_mode_from_str() {
        assert_eq!("Independent".parse::<DispatchMode>().unwrap(), DispatchMode::Independent);
        assert_eq!(" windowed ".parse::<DispatchMode>().unwrap(), DispatchMode::Windowed);
        assert!("greedy".parse::<DispatchMode>().is_err());
    }
}
