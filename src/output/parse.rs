//! 命令输出解析
//!
//! 组合命令用 `===NAME===` 行分段，每段交给对应的解析函数。
//! 解析函数对缺失或格式不符的输入返回默认值，不报错。

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::models::{
    BackupEntry, ContainerInfo, DirUsage, DiskStats, DockerDiskRow, ImageInfo, ServerInfo,
    SystemUsage,
};

static SECTION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^===([A-Z_]+)===$").unwrap());

/// 生成分段标记命令
pub fn section_marker(name: &str) -> String {
    format!("echo '==={}==='", name)
}

/// 按 `===NAME===` 标记分段后的输出
#[derive(Debug, Default)]
pub struct Sections {
    sections: HashMap<String, String>,
}

impl Sections {
    pub fn parse(stdout: &str) -> Self {
        let mut sections = HashMap::new();
        let mut current: Option<(String, Vec<&str>)> = None;

        for line in stdout.lines() {
            if let Some(caps) = SECTION_MARKER.captures(line.trim()) {
                if let Some((name, lines)) = current.take() {
                    sections.insert(name, lines.join("\n"));
                }
                current = Some((caps[1].to_string(), Vec::new()));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }
        }

        if let Some((name, lines)) = current {
            sections.insert(name, lines.join("\n"));
        }

        Self { sections }
    }

    /// 段内容（已去除首尾空白），缺失时为空字符串
    pub fn get(&self, name: &str) -> &str {
        self.sections.get(name).map(|s| s.trim()).unwrap_or("")
    }
}

/// 逐行解析 `--format '{{json .}}'` 输出，跳过无法解析的行
pub fn parse_json_lines<T: DeserializeOwned>(text: &str) -> Vec<T> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(row) => Some(row),
            Err(e) => {
                debug!(error = %e, line = %line, "Skipping unparsable JSON line");
                None
            }
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerPsRow {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Ports")]
    ports: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerStatsRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerImageRow {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "CreatedSince")]
    created_since: String,
    #[serde(rename = "Size")]
    size: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerSystemDfRow {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Size")]
    size: String,
    #[serde(rename = "Reclaimable")]
    reclaimable: String,
}

/// `docker ps` 与 `docker stats --no-stream` 按容器名合并
pub fn parse_containers(ps: &str, stats: &str) -> Vec<ContainerInfo> {
    let stats: HashMap<String, DockerStatsRow> = parse_json_lines::<DockerStatsRow>(stats)
        .into_iter()
        .map(|row| (row.name.clone(), row))
        .collect();

    parse_json_lines::<DockerPsRow>(ps)
        .into_iter()
        .map(|row| {
            let usage = stats.get(&row.names);
            ContainerInfo {
                memory: usage.map(|s| s.mem_usage.clone()),
                cpu: usage.map(|s| s.cpu_perc.clone()),
                name: row.names,
                image: row.image,
                status: row.status,
                state: row.state,
                ports: row.ports,
            }
        })
        .collect()
}

/// `docker system df --format '{{json .}}'`
pub fn parse_docker_disk(text: &str) -> Vec<DockerDiskRow> {
    parse_json_lines::<DockerSystemDfRow>(text)
        .into_iter()
        .map(|row| DockerDiskRow {
            kind: row.kind,
            size: row.size,
            reclaimable: row.reclaimable,
        })
        .collect()
}

/// `docker images --format '{{json .}}'`，仓库名包含 `filter` 的镜像
pub fn parse_images(text: &str, filter: &str) -> Vec<ImageInfo> {
    parse_json_lines::<DockerImageRow>(text)
        .into_iter()
        .filter(|row| filter.is_empty() || row.repository.contains(filter))
        .map(|row| ImageInfo {
            repository: row.repository,
            tag: row.tag,
            id: row.id,
            created: row.created_since,
            size: row.size,
        })
        .collect()
}

/// 两行：`free -h` 的 total used；`df -h /` 的 size used avail use%
pub fn parse_system_usage(text: &str) -> SystemUsage {
    let mut lines = text.lines().map(str::split_whitespace);
    let mut usage = SystemUsage::default();

    if let Some(mut mem) = lines.next() {
        usage.memory_total = mem.next().unwrap_or_default().to_string();
        usage.memory_used = mem.next().unwrap_or_default().to_string();
    }
    if let Some(mut disk) = lines.next() {
        usage.disk_total = disk.next().unwrap_or_default().to_string();
        usage.disk_used = disk.next().unwrap_or_default().to_string();
        let _available = disk.next();
        usage.disk_percent = disk.next().unwrap_or_default().to_string();
    }

    usage
}

/// `size used avail use%`
pub fn parse_disk_stats(line: &str) -> DiskStats {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let field = |i: usize| parts.get(i).map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());

    DiskStats {
        total: field(0),
        used: field(1),
        available: field(2),
        percent: field(3),
    }
}

/// 三行：hostname、PRETTY_NAME、uptime -p
pub fn parse_server_info(text: &str, address: &str) -> ServerInfo {
    let mut lines = text.lines().map(str::trim);
    let mut next = || lines.next().unwrap_or_default().to_string();

    ServerInfo {
        address: address.to_string(),
        hostname: next(),
        os: next().trim_matches('"').to_string(),
        uptime: next(),
    }
}

/// "87%"、" 87 " 之类的百分比，超过 100 截断为 100
pub fn parse_percent(text: &str) -> Option<u8> {
    let value: f64 = text.trim().trim_end_matches('%').trim().parse().ok()?;
    if value.is_nan() || value < 0.0 {
        return None;
    }
    Some(value.round().min(100.0) as u8)
}

/// `du -sh <dir>/*/` 输出（size\tpath），名称去掉 `base` 前缀与末尾斜杠
pub fn parse_dir_usage(text: &str, base: &str) -> Vec<DirUsage> {
    let prefix = format!("{}/", base.trim_end_matches('/'));

    text.lines()
        .filter_map(|line| {
            let (size, path) = line.split_once('\t')?;
            let name = path.trim().trim_end_matches('/');
            let name = name.strip_prefix(&prefix).unwrap_or(name);
            Some(DirUsage {
                name: name.to_string(),
                size: size.trim().to_string(),
            })
        })
        .collect()
}

/// `ls -lh <dir>/*.tar.gz | awk '{print $9,$5,$6,$7}'`
pub fn parse_backups(text: &str) -> Vec<BackupEntry> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            let file = parts[0].rsplit('/').next().unwrap_or(parts[0]);
            Some(BackupEntry {
                file: file.to_string(),
                size: parts[1].to_string(),
                date: format!("{} {}", parts[2], parts[3]),
            })
        })
        .collect()
}

/// 监听地址列（`0.0.0.0:3000`、`[::]:8080`、`:::8080`）中的端口，去重排序
pub fn parse_listening_ports(text: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = text
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next()?.parse().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}
