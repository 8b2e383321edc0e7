//! 进程表 - 基础设施层
//!
//! 对操作系统进程的最小抽象：列出、发信号、查找监听端口的进程。
//! 清理器和遥测探针只通过 `ProcessTable` 访问进程，测试里可以替换成假实现。

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{AppError, AppResult};

/// Linux 上 /proc/<pid>/stat 的时间单位（USER_HZ）
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// TCP LISTEN 状态
const TCP_LISTEN: &str = "0A";

/// 一个系统进程的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    /// 可执行文件名（/proc/<pid>/comm）
    pub name: String,
    /// 完整命令行，参数之间以空格分隔
    pub cmdline: String,
    /// 进程已运行时间
    pub age: Duration,
}

impl ProcessInfo {
    /// 进程名是否匹配任意特征（不区分大小写）
    pub fn matches_any(&self, patterns: &[String]) -> bool {
        let name = self.name.to_ascii_lowercase();
        let exe = self
            .cmdline
            .split_whitespace()
            .next()
            .and_then(|argv0| Path::new(argv0).file_name())
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        patterns.iter().any(|p| {
            let p = p.to_ascii_lowercase();
            name.contains(&p) || exe.contains(&p)
        })
    }

    /// 命令行中是否带有某个归属标记
    pub fn carries_marker(&self, marker: &str) -> bool {
        !marker.is_empty() && self.cmdline.contains(marker)
    }
}

/// 要发送的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM，允许进程自行清理
    Terminate,
    /// SIGKILL
    Kill,
}

impl From<KillSignal> for Signal {
    fn from(sig: KillSignal) -> Self {
        match sig {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// 发信号的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled,
    /// 进程已经不存在
    AlreadyGone,
    /// 没有权限
    Denied,
}

/// 进程表
pub trait ProcessTable: Send + Sync {
    /// 列出当前所有进程（不含本进程）
    fn list(&self) -> AppResult<Vec<ProcessInfo>>;

    /// 向进程发送信号；已退出的进程返回 `AlreadyGone`，不是错误
    fn signal(&self, pid: u32, sig: KillSignal) -> KillOutcome;

    fn is_alive(&self, pid: u32) -> bool;

    /// 在指定 TCP 端口上监听的进程
    fn listening_pids(&self, port: u16) -> Vec<u32>;
}

/// 基于 /proc 的进程表
#[derive(Debug, Default, Clone)]
pub struct ProcFsTable;

impl ProcFsTable {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessTable for ProcFsTable {
    fn list(&self) -> AppResult<Vec<ProcessInfo>> {
        let own_pid = std::process::id();
        let uptime = std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| parse_uptime(&s))
            .unwrap_or_default();

        let entries = std::fs::read_dir("/proc")
            .map_err(|e| AppError::file_read_failed("/proc", e))?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            // 进程可能在扫描过程中退出，读不到就跳过
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                continue;
            };
            let Some(parsed) = parse_stat(&stat) else {
                continue;
            };
            let cmdline = std::fs::read(format!("/proc/{pid}/cmdline"))
                .map(|raw| parse_cmdline(&raw))
                .unwrap_or_default();

            let started = Duration::from_millis(parsed.start_ticks * 1000 / CLOCK_TICKS_PER_SEC);
            processes.push(ProcessInfo {
                pid,
                ppid: parsed.ppid,
                name: parsed.name,
                cmdline,
                age: uptime.saturating_sub(started),
            });
        }
        Ok(processes)
    }

    fn signal(&self, pid: u32, sig: KillSignal) -> KillOutcome {
        let Ok(raw) = i32::try_from(pid) else {
            return KillOutcome::AlreadyGone;
        };
        match kill(Pid::from_raw(raw), Signal::from(sig)) {
            Ok(()) => KillOutcome::Signalled,
            Err(Errno::ESRCH) => KillOutcome::AlreadyGone,
            Err(e) => {
                tracing::debug!("向进程 {} 发送 {:?} 失败: {}", pid, sig, e);
                KillOutcome::Denied
            }
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        i32::try_from(pid)
            .map(|raw| kill(Pid::from_raw(raw), None).is_ok())
            .unwrap_or(false)
    }

    fn listening_pids(&self, port: u16) -> Vec<u32> {
        let mut inodes = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = std::fs::read_to_string(table) {
                inodes.extend(parse_listening_inodes(&content, port));
            }
        }
        if inodes.is_empty() {
            return Vec::new();
        }

        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns_socket = fds.flatten().any(|fd| {
                std::fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target.to_string_lossy()))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if owns_socket {
                pids.push(pid);
            }
        }
        pids
    }
}

// ========== /proc 解析 ==========

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StatFields {
    pub name: String,
    pub ppid: u32,
    pub start_ticks: u64,
}

/// 解析 /proc/<pid>/stat
///
/// comm 字段包在括号里，可能含空格和括号，所以从最后一个 ')' 切分。
pub(crate) fn parse_stat(contents: &str) -> Option<StatFields> {
    let open = contents.find('(')?;
    let (head, after_comm) = contents.rsplit_once(')')?;
    let name = head.get(open + 1..)?.to_string();

    let tokens: Vec<&str> = after_comm.split_whitespace().collect();
    // tokens[0] 是字段 3 (state)
    let ppid = tokens.get(1)?.parse().ok()?;
    let start_ticks = tokens.get(19)?.parse().ok()?;
    Some(StatFields {
        name,
        ppid,
        start_ticks,
    })
}

pub(crate) fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn parse_uptime(contents: &str) -> Option<Duration> {
    let secs: f64 = contents.split_whitespace().next()?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// 从 /proc/net/tcp 中找出在指定端口 LISTEN 的 socket inode
pub(crate) fn parse_listening_inodes(contents: &str, port: u16) -> Vec<u64> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?.parse::<u64>().ok()?;
            let local_port = u16::from_str_radix(local.rsplit_once(':')?.1, 16).ok()?;
            (local_port == port && *state == TCP_LISTEN && inode != 0).then_some(inode)
        })
        .collect()
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
