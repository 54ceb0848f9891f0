//! 面板操作请求/响应

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ssh::CommandResult;

/// 合法的容器名（docker 命名规则）
pub static CONTAINER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").unwrap());

/// 日志目标服务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTarget {
    #[default]
    Backend,
    Frontend,
}

impl std::str::FromStr for ServiceTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            _ => Err(format!("Unknown service: {}", s)),
        }
    }
}

fn default_log_lines() -> u32 {
    100
}

/// 日志查询
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LogRequest {
    #[serde(default)]
    pub service: ServiceTarget,
    #[serde(default = "default_log_lines")]
    #[validate(range(min = 1, max = 5000))]
    pub lines: u32,
}

impl Default for LogRequest {
    fn default() -> Self {
        Self {
            service: ServiceTarget::default(),
            lines: default_log_lines(),
        }
    }
}

/// 服务控制动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    /// git pull 后重启
    Update,
    /// 无缓存重建镜像
    Rebuild,
    /// 清理 30 天前的决策日志
    CleanLogs,
}

impl ServiceAction {
    /// 破坏性动作需要显式确认
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, ServiceAction::Start | ServiceAction::Restart)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Update => "update",
            ServiceAction::Rebuild => "rebuild",
            ServiceAction::CleanLogs => "clean_logs",
        }
    }
}

impl std::str::FromStr for ServiceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "update" => Ok(Self::Update),
            "rebuild" => Ok(Self::Rebuild),
            "clean_logs" => Ok(Self::CleanLogs),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// 服务控制请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServiceRequest {
    pub action: ServiceAction,
    /// 容器名；为空或 "all" 表示整个 compose 项目
    #[serde(default)]
    #[validate(regex(path = *CONTAINER_NAME))]
    pub target: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

impl ServiceRequest {
    pub fn new(action: ServiceAction) -> Self {
        Self {
            action,
            target: None,
            confirm: false,
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// 单个容器目标（"all" 视为整个项目）
    pub fn container(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty() && *t != "all")
    }
}

/// 清理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupKind {
    /// docker 构建缓存
    DockerCache,
    /// 未使用的镜像
    DockerImages,
    /// 7 天前的日志文件
    Logs,
}

impl std::str::FromStr for CleanupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "docker_cache" => Ok(Self::DockerCache),
            "docker_images" => Ok(Self::DockerImages),
            "logs" => Ok(Self::Logs),
            _ => Err(format!("Unknown cleanup kind: {}", s)),
        }
    }
}

/// 变更类操作的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub duration_secs: f64,
    pub finished_at: DateTime<Utc>,
}

impl From<CommandResult> for ActionOutcome {
    fn from(result: CommandResult) -> Self {
        Self {
            success: result.is_success(),
            output: result.stdout.trim_end().to_string(),
            error: result.stderr.trim_end().to_string(),
            exit_code: result.exit_code,
            duration_secs: result.duration_secs,
            finished_at: Utc::now(),
        }
    }
}

/// 备份文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub file: String,
    pub size: String,
    /// `ls -l` 的月份和日期，例如 "Jan 5"
    pub date: String,
}

/// 远程 `.env` 文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfigFile {
    pub content: String,
    pub exists: bool,
}

/// 写入远程 `.env`
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RemoteConfigUpdate {
    #[validate(length(max = 262144))]
    pub content: String,
    #[serde(default)]
    pub confirm: bool,
}

/// 镜像信息（`docker images`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub repository: String,
    pub tag: String,
    pub id: String,
    pub created: String,
    pub size: String,
}
