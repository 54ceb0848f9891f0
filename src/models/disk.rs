//! 磁盘使用情况

use serde::{Deserialize, Serialize};

/// 根分区使用情况（`df -h /`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub total: String,
    pub used: String,
    pub available: String,
    pub percent: String,
}

impl Default for DiskStats {
    fn default() -> Self {
        Self {
            total: "-".to_string(),
            used: "-".to_string(),
            available: "-".to_string(),
            percent: "-".to_string(),
        }
    }
}

/// `docker system df` 的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerDiskRow {
    /// Images / Containers / Local Volumes / Build Cache
    #[serde(rename = "type")]
    pub kind: String,
    pub size: String,
    pub reclaimable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirUsage {
    /// 相对项目目录的名称
    pub name: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUsage {
    pub path: String,
    pub total: String,
    /// 按大小降序，最多 8 项
    pub dirs: Vec<DirUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    pub system: DiskStats,
    pub docker: Vec<DockerDiskRow>,
    pub project: ProjectUsage,
}
