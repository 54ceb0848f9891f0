//! 服务器状态快照

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 容器信息（`docker ps` 与 `docker stats` 合并）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    /// 例如 "Up 3 hours"
    pub status: String,
    /// running / exited / ...
    pub state: String,
    pub ports: String,
    /// 例如 "120MiB / 1.9GiB"，容器未运行时为空
    pub memory: Option<String>,
    /// 例如 "0.52%"
    pub cpu: Option<String>,
}

impl ContainerInfo {
    pub fn is_up(&self) -> bool {
        self.status.starts_with("Up")
    }
}

/// 系统资源（人类可读格式）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemUsage {
    pub memory_total: String,
    pub memory_used: String,
    pub disk_total: String,
    pub disk_used: String,
    pub disk_percent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// 配置中的远程主机地址
    pub address: String,
    pub hostname: String,
    pub os: String,
    pub uptime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub containers: Vec<ContainerInfo>,
    pub system: SystemUsage,
    pub server: ServerInfo,
    pub collected_at: DateTime<Utc>,
}
