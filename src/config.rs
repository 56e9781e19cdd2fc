use crate::error::{CheckError, Result};
use crate::types::RankMode;
use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// Include the default settings at compile time
const DEFAULT_SETTINGS: &str = include_str!("../assets/settings.toml");

/// 探测结束后, 留给进程退出与清理的额外时间
const DEADLINE_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// 订阅地址 (http/https) 或本地文件路径
    pub subscriptions: Vec<String>,
    pub fetch_timeout_ms: u64,
    /// 合并后按节点名剔除的正则
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    pub schedule: ScheduleSettings,
    pub probe: ProbeSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub concurrency: usize,
    pub base_port: u16,
    pub rounds: u32,
    pub mode: RankMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub tunnel_program: PathBuf,
    /// `{config}` 会被替换为临时配置文件路径
    pub tunnel_args: Vec<String>,
    /// 临时配置目录, 默认使用系统临时目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    pub startup_grace_ms: u64,
    pub health_url: String,
    pub latency_timeout_ms: u64,
    pub throughput: bool,
    pub throughput_url: String,
    pub throughput_timeout_ms: u64,
    pub throughput_cap_bytes: u64,
    pub kill_timeout_ms: u64,
    /// 单次探测的硬性截止时间, 不设置时由各阶段超时推算
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub template: PathBuf,
    pub path: PathBuf,
    /// 需要填入节点名单的策略组
    pub groups: Vec<String>,
}

impl Settings {
    /// Load settings
    /// Strategy:
    /// 1. Start from the built-in assets/settings.toml
    /// 2. Overlay the explicit file, or ~/.config/nodecheck/settings.toml if it exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut merged: toml::Table = toml::from_str(DEFAULT_SETTINGS)?;

        let user_path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => ProjectDirs::from("", "", "nodecheck")
                .map(|dirs| dirs.config_dir().join("settings.toml"))
                .filter(|path| path.exists()),
        };

        if let Some(path) = user_path {
            let content = fs::read_to_string(&path)?;
            let user: toml::Table = toml::from_str(&content)?;
            overlay(&mut merged, user);
            info!("Loaded settings from {:?}", path);
        }

        let settings: Settings = toml::Value::Table(merged).try_into()?;
        Ok(settings.normalized())
    }

    /// 空字符串视为未设置, 便于用户配置覆盖默认值
    fn normalized(mut self) -> Self {
        if self.exclude.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.exclude = None;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let schedule = &self.schedule;
        if schedule.concurrency == 0 {
            return Err(CheckError::Config("concurrency must be at least 1".into()));
        }
        if schedule.rounds == 0 {
            return Err(CheckError::Config("rounds must be at least 1".into()));
        }
        if schedule.base_port == 0 {
            return Err(CheckError::Config("base_port must be at least 1".into()));
        }
        let last_port = u32::from(schedule.base_port) + schedule.concurrency as u32 - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(CheckError::Config(format!(
                "base_port {} + concurrency {} exceeds the port range",
                schedule.base_port, schedule.concurrency
            )));
        }

        let probe = &self.probe;
        let timeouts = [
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("startup_grace_ms", probe.startup_grace_ms),
            ("latency_timeout_ms", probe.latency_timeout_ms),
            ("throughput_timeout_ms", probe.throughput_timeout_ms),
            ("kill_timeout_ms", probe.kill_timeout_ms),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(CheckError::Config(format!("{} must be positive", key)));
        }
        if let Some(deadline_ms) = probe.deadline_ms {
            if deadline_ms <= probe.startup_grace_ms {
                return Err(CheckError::Config(
                    "deadline_ms must exceed startup_grace_ms".into(),
                ));
            }
        }
        if probe.throughput && probe.throughput_cap_bytes == 0 {
            return Err(CheckError::Config(
                "throughput_cap_bytes must be positive".into(),
            ));
        }

        if self.subscriptions.is_empty() {
            return Err(CheckError::Config("no subscriptions configured".into()));
        }

        self.exclude_pattern()?;
        Ok(())
    }

    pub fn exclude_pattern(&self) -> Result<Option<Regex>> {
        Ok(match self.exclude.as_deref() {
            Some(pattern) => Some(Regex::new(pattern)?),
            None => None,
        })
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl ProbeSettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn latency_timeout(&self) -> Duration {
        Duration::from_millis(self.latency_timeout_ms)
    }

    pub fn throughput_timeout(&self) -> Duration {
        Duration::from_millis(self.throughput_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// 单次探测的硬性截止时间 (含启动等待), 超时则强制结束隧道并判定失败
    pub fn deadline(&self) -> Duration {
        if let Some(ms) = self.deadline_ms {
            return Duration::from_millis(ms);
        }
        let mut deadline = self.startup_grace() + self.latency_timeout() + DEADLINE_SLACK;
        if self.throughput {
            deadline += self.throughput_timeout();
        }
        deadline
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// 按表递归覆盖: 子表合并, 其他值直接替换
fn overlay(base: &mut toml::Table, user: toml::Table) {
    for (key, value) in user {
        if let toml::Value::Table(user_table) = value {
            if let Some(toml::Value::Table(base_table)) = base.get_mut(&key) {
                overlay(base_table, user_table);
                continue;
            }
            base.insert(key, toml::Value::Table(user_table));
        } else {
            base.insert(key, value);
        }
    }
}

/// 测试用探测配置: 短超时, 指定的隧道程序, 不测速
#[cfg(test)]
pub(crate) fn test_probe_settings(work_dir: &Path, program: &str, args: &[&str]) -> ProbeSettings {
    ProbeSettings {
        tunnel_program: PathBuf::from(program),
        tunnel_args: args.iter().map(|a| a.to_string()).collect(),
        work_dir: Some(work_dir.to_path_buf()),
        startup_grace_ms: 200,
        health_url: "http://127.0.0.1:1/generate_204".to_string(),
        latency_timeout_ms: 2000,
        throughput: false,
        throughput_url: "http://127.0.0.1:1/big".to_string(),
        throughput_timeout_ms: 2000,
        throughput_cap_bytes: 256 * 1024,
        kill_timeout_ms: 2000,
        deadline_ms: None,
    }
}
