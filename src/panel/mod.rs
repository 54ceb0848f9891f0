//! 运维面板操作
//!
//! 每个操作拼出一条 shell 命令交给 [`CommandExecutor`]，再把文本输出解析为模型。
//! 状态、磁盘、诊断都只发一条分段命令，池大小为 1 时也能完成。
//! 状态快照按 `status_cache_ttl_secs` 缓存，变更类操作会使缓存失效。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, info};
use validator::Validate;

use crate::config::PanelConfig;
use crate::error::AppError;
use crate::models::{
    ActionOutcome, BackupEntry, CheckStatus, CleanupKind, DiagnoseCheck, DiagnoseReport,
    DiskUsage, ImageInfo, LogRequest, ProjectUsage, RemoteConfigFile, RemoteConfigUpdate,
    ServiceAction, ServiceRequest, ServiceTarget, StatusSnapshot,
};
use crate::output::parse::{self, section_marker, Sections};
use crate::ssh::{CommandExecutor, CommandResult, Connector, RusshConnector, SshError};

/// `git pull` + 重启
const UPDATE_TIMEOUT: Duration = Duration::from_secs(300);
/// 无缓存重建镜像
const REBUILD_TIMEOUT: Duration = Duration::from_secs(1800);
const PRUNE_TIMEOUT: Duration = Duration::from_secs(300);
const BACKUP_TIMEOUT: Duration = Duration::from_secs(600);

const DOCKER_JSON: &str = "--format '{{json .}}'";

/// 单引号转义，用于拼接配置中的路径和名称
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 面板操作入口
pub struct OpsPanel<C: Connector = RusshConnector> {
    executor: Arc<CommandExecutor<C>>,
    config: PanelConfig,
    /// 远程主机地址（用于状态展示）
    address: String,
    status_cache: Mutex<Option<(Instant, StatusSnapshot)>>,
}

impl<C: Connector> OpsPanel<C> {
    pub fn new(executor: Arc<CommandExecutor<C>>, config: PanelConfig, address: impl Into<String>) -> Self {
        Self {
            executor,
            config,
            address: address.into(),
            status_cache: Mutex::new(None),
        }
    }

    pub fn executor(&self) -> &CommandExecutor<C> {
        &self.executor
    }

    /// 执行命令；执行器层失败转换为错误
    async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandResult, AppError> {
        let result = self.executor.run(command, timeout).await;
        self.check(result, timeout)
    }

    async fn run_with_input(
        &self,
        command: &str,
        input: &[u8],
        timeout: Option<Duration>,
    ) -> Result<CommandResult, AppError> {
        let result = self.executor.run_with_input(command, input, timeout).await;
        self.check(result, timeout)
    }

    fn check(&self, result: CommandResult, timeout: Option<Duration>) -> Result<CommandResult, AppError> {
        if result.timed_out {
            let limit = timeout.unwrap_or_else(|| self.executor.default_timeout());
            return Err(AppError::Ssh(SshError::CommandTimeout(limit)));
        }
        if result.is_executor_failure() {
            return Err(AppError::RemoteUnavailable(result.stderr));
        }

        Ok(result)
    }

    fn remote_dir(&self) -> String {
        shell_quote(&self.config.remote_dir)
    }

    fn env_file(&self) -> String {
        shell_quote(&format!("{}/.env", self.config.remote_dir.trim_end_matches('/')))
    }

    fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.config.status_cache_ttl_secs)
    }

    fn cached_status(&self) -> Option<StatusSnapshot> {
        let cache = self.status_cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.as_ref() {
            Some((stored, snapshot)) if stored.elapsed() < self.status_ttl() => Some(snapshot.clone()),
            _ => None,
        }
    }

    /// 清空状态缓存
    pub fn invalidate_status(&self) {
        *self.status_cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 容器、资源与主机概况（带缓存）
    pub async fn status(&self) -> Result<StatusSnapshot, AppError> {
        if let Some(snapshot) = self.cached_status() {
            debug!("Serving cached status snapshot");
            return Ok(snapshot);
        }

        let snapshot = self.refresh_status().await?;
        if !self.status_ttl().is_zero() {
            *self.status_cache.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((Instant::now(), snapshot.clone()));
        }

        Ok(snapshot)
    }

    /// 跳过缓存直接采集状态
    pub async fn refresh_status(&self) -> Result<StatusSnapshot, AppError> {
        let command = [
            section_marker("CONTAINERS"),
            format!("docker ps -a {} 2>/dev/null", DOCKER_JSON),
            section_marker("STATS"),
            format!("docker stats --no-stream {} 2>/dev/null", DOCKER_JSON),
            section_marker("SYSTEM"),
            "free -h | awk '/^Mem:/ {print $2,$3}'".to_string(),
            "df -h / | awk 'NR==2 {print $2,$3,$4,$5}'".to_string(),
            section_marker("SERVER"),
            "hostname".to_string(),
            "grep '^PRETTY_NAME=' /etc/os-release | cut -d= -f2".to_string(),
            "uptime -p".to_string(),
        ]
        .join("; ");

        let result = self.run(&command, None).await?;
        let sections = Sections::parse(&result.stdout);

        Ok(StatusSnapshot {
            containers: parse::parse_containers(sections.get("CONTAINERS"), sections.get("STATS")),
            system: parse::parse_system_usage(sections.get("SYSTEM")),
            server: parse::parse_server_info(sections.get("SERVER"), &self.address),
            collected_at: chrono::Utc::now(),
        })
    }

    /// 根分区、docker 与项目目录占用
    pub async fn disk_usage(&self) -> Result<DiskUsage, AppError> {
        let dir = self.remote_dir();
        let command = [
            section_marker("DF"),
            "df -h / | awk 'NR==2 {print $2,$3,$4,$5}'".to_string(),
            section_marker("DOCKER"),
            format!("docker system df {} 2>/dev/null", DOCKER_JSON),
            section_marker("PROJECT"),
            format!("du -sh {} 2>/dev/null | awk '{{print $1}}'", dir),
            section_marker("DIRS"),
            format!("du -sh {}/*/ 2>/dev/null | sort -rh | head -8", dir),
        ]
        .join("; ");

        let result = self.run(&command, None).await?;
        let sections = Sections::parse(&result.stdout);

        let total = match sections.get("PROJECT") {
            "" => "-".to_string(),
            size => size.to_string(),
        };

        Ok(DiskUsage {
            system: parse::parse_disk_stats(sections.get("DF")),
            docker: parse::parse_docker_disk(sections.get("DOCKER")),
            project: ProjectUsage {
                path: self.config.remote_dir.clone(),
                total,
                dirs: parse::parse_dir_usage(sections.get("DIRS"), &self.config.remote_dir),
            },
        })
    }

    /// 健康诊断
    pub async fn diagnose(&self) -> Result<DiagnoseReport, AppError> {
        let command = [
            section_marker("DOCKER"),
            "systemctl is-active docker 2>&1".to_string(),
            section_marker("CONTAINERS"),
            format!("docker ps -a {} 2>/dev/null", DOCKER_JSON),
            section_marker("PORTS"),
            "(ss -tln 2>/dev/null || netstat -tln 2>/dev/null) | awk 'NR>1 {print $4}'".to_string(),
            section_marker("DISK"),
            "df -P / | awk 'NR==2 {print $5}'".to_string(),
            section_marker("MEMORY"),
            "free | awk '/^Mem:/ {printf \"%.0f\\n\", $3/$2*100}'".to_string(),
        ]
        .join("; ");

        let result = self.run(&command, None).await?;
        let sections = Sections::parse(&result.stdout);
        let mut checks = Vec::new();

        let docker = sections.get("DOCKER");
        checks.push(DiagnoseCheck::new(
            "docker_service",
            if docker == "active" { CheckStatus::Ok } else { CheckStatus::Error },
            if docker.is_empty() { "unknown" } else { docker },
        ));

        let containers = parse::parse_containers(sections.get("CONTAINERS"), "");
        if containers.is_empty() {
            checks.push(DiagnoseCheck::new("containers", CheckStatus::Warning, "no containers found"));
        }
        for container in &containers {
            checks.push(DiagnoseCheck::new(
                format!("container:{}", container.name),
                if container.is_up() { CheckStatus::Ok } else { CheckStatus::Error },
                container.status.clone(),
            ));
        }

        checks.push(self.port_check(sections.get("PORTS")));
        checks.push(usage_check("disk", sections.get("DISK")));
        checks.push(usage_check("memory", sections.get("MEMORY")));

        let report = DiagnoseReport::new(checks);
        info!(overall = ?report.overall, checks = report.checks.len(), "Diagnosis finished");
        Ok(report)
    }

    fn port_check(&self, text: &str) -> DiagnoseCheck {
        let listening = parse::parse_listening_ports(text);
        let missing: Vec<String> = self
            .config
            .expected_ports
            .iter()
            .filter(|port| !listening.contains(*port))
            .map(u16::to_string)
            .collect();

        if missing.is_empty() {
            let ports: Vec<String> = self.config.expected_ports.iter().map(u16::to_string).collect();
            DiagnoseCheck::new("ports", CheckStatus::Ok, format!("listening: {}", ports.join(", ")))
        } else {
            DiagnoseCheck::new("ports", CheckStatus::Warning, format!("not listening: {}", missing.join(", ")))
        }
    }

    /// 容器最近日志
    pub async fn logs(&self, request: LogRequest) -> Result<Vec<String>, AppError> {
        request.validate()?;

        let container = match request.service {
            ServiceTarget::Backend => &self.config.backend_container,
            ServiceTarget::Frontend => &self.config.frontend_container,
        };
        let command = format!("docker logs --tail {} {} 2>&1", request.lines, shell_quote(container));

        let result = self.run(&command, None).await?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    /// 服务控制
    pub async fn service_action(&self, request: ServiceRequest) -> Result<ActionOutcome, AppError> {
        request.validate()?;

        let action = request.action;
        if action.requires_confirmation() && !request.confirm {
            return Err(AppError::ConfirmationRequired(action.as_str().to_string()));
        }

        let dir = self.remote_dir();
        let container = request.container().map(shell_quote);
        let (command, timeout) = match (action, container) {
            (ServiceAction::Start, Some(c)) => (format!("docker start {}", c), None),
            (ServiceAction::Start, None) => (format!("cd {} && docker compose up -d", dir), None),
            (ServiceAction::Stop, Some(c)) => (format!("docker stop {}", c), None),
            (ServiceAction::Stop, None) => (format!("cd {} && docker compose stop", dir), None),
            (ServiceAction::Restart, Some(c)) => (format!("docker restart {}", c), None),
            (ServiceAction::Restart, None) => (format!("cd {} && docker compose restart", dir), None),
            (ServiceAction::Update, _) => (
                format!("cd {} && git pull && docker compose restart", dir),
                Some(UPDATE_TIMEOUT),
            ),
            (ServiceAction::Rebuild, _) => (
                format!(
                    "cd {} && docker compose down && docker compose build --no-cache && docker compose up -d",
                    dir
                ),
                Some(REBUILD_TIMEOUT),
            ),
            (ServiceAction::CleanLogs, _) => (
                format!(
                    "find {}/decision_logs -name '*.json' -mtime +30 -delete 2>/dev/null; echo 'decision logs older than 30 days removed'",
                    dir
                ),
                None,
            ),
        };

        info!(action = action.as_str(), target = ?request.container(), "Running service action");
        self.invalidate_status();
        let result = self.run(&command, timeout).await?;
        Ok(ActionOutcome::from(result))
    }

    /// 清理磁盘空间
    pub async fn cleanup(&self, kind: CleanupKind, confirm: bool) -> Result<ActionOutcome, AppError> {
        let (name, command, timeout) = match kind {
            CleanupKind::DockerCache => (
                "docker_cache",
                "docker builder prune -af 2>&1 | tail -1".to_string(),
                Some(PRUNE_TIMEOUT),
            ),
            CleanupKind::DockerImages => (
                "docker_images",
                "docker image prune -af 2>&1 | tail -1".to_string(),
                Some(PRUNE_TIMEOUT),
            ),
            CleanupKind::Logs => (
                "logs",
                format!(
                    "find {}/data -name '*.log' -mtime +7 -delete 2>/dev/null; echo 'logs older than 7 days removed'",
                    self.remote_dir()
                ),
                None,
            ),
        };

        if !confirm {
            return Err(AppError::ConfirmationRequired(format!("cleanup {}", name)));
        }

        info!(kind = name, "Running cleanup");
        self.invalidate_status();
        let result = self.run(&command, timeout).await?;
        Ok(ActionOutcome::from(result))
    }

    /// 备份列表
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>, AppError> {
        let command = format!(
            "ls -lh {}/*.tar.gz 2>/dev/null | awk '{{print $9,$5,$6,$7}}'",
            shell_quote(self.config.backup_dir.trim_end_matches('/'))
        );

        let result = self.run(&command, None).await?;
        Ok(parse::parse_backups(&result.stdout))
    }

    /// 运行远程备份脚本
    pub async fn create_backup(&self) -> Result<ActionOutcome, AppError> {
        let script = shell_quote(&format!("{}/backup.sh", self.config.remote_dir.trim_end_matches('/')));

        info!(script = %script, "Creating backup");
        let result = self.run(&script, Some(BACKUP_TIMEOUT)).await?;
        Ok(ActionOutcome::from(result))
    }

    /// 读取远程 `.env`
    pub async fn read_remote_config(&self) -> Result<RemoteConfigFile, AppError> {
        let result = self.run(&format!("cat {} 2>/dev/null", self.env_file()), None).await?;
        let exists = result.exit_code == 0;

        Ok(RemoteConfigFile {
            content: if exists { result.stdout } else { String::new() },
            exists,
        })
    }

    /// 备份为 `.env.bak` 后写入新的 `.env`
    ///
    /// 内容 base64 编码后经标准输入传给远端，不进入命令行，也不经过 shell 解释。
    pub async fn write_remote_config(&self, update: RemoteConfigUpdate) -> Result<ActionOutcome, AppError> {
        update.validate()?;
        if !update.confirm {
            return Err(AppError::ConfirmationRequired("write remote config".to_string()));
        }

        let path = format!("{}/.env", self.config.remote_dir.trim_end_matches('/'));
        let env = shell_quote(&path);
        let backup = shell_quote(&format!("{}.bak", path));
        let staging = shell_quote(&format!("{}.tmp", path));
        let payload = general_purpose::STANDARD.encode(update.content.as_bytes());

        let command = format!(
            "(cp {env} {backup} 2>/dev/null || true) && base64 -d > {staging} && mv {staging} {env}",
        );

        info!(path = %path, bytes = update.content.len(), "Writing remote config");
        let result = self.run_with_input(&command, payload.as_bytes(), None).await?;
        Ok(ActionOutcome::from(result))
    }

    /// 项目相关镜像
    pub async fn current_images(&self) -> Result<Vec<ImageInfo>, AppError> {
        let result = self
            .run(&format!("docker images {} 2>/dev/null", DOCKER_JSON), None)
            .await?;
        Ok(parse::parse_images(&result.stdout, &self.config.image_filter))
    }
}

/// 百分比类检查
fn usage_check(name: &str, text: &str) -> DiagnoseCheck {
    match parse::parse_percent(text) {
        Some(percent) => DiagnoseCheck::new(name, CheckStatus::from_percent(percent), format!("{}% used", percent)),
        None => DiagnoseCheck::new(name, CheckStatus::Warning, format!("unable to read {} usage", name)),
    }
}
