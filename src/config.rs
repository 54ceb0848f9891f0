//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use secrecy::Secret;
use serde::Deserialize;

use crate::ssh::{ForwardSpec, HostKeyVerification, RemoteTarget, SshAuth};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:8800"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
    /// CORS 允许的来源（为空表示允许任意来源）
    #[serde(default)]
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

/// 远程主机（被管理的 Docker 主机）
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// 主机地址
    pub host: String,
    /// SSH 端口
    pub port: u16,
    /// 登录用户名
    pub username: String,
    /// 私钥文件路径，支持 `~/` 前缀
    pub key_path: String,
    /// 私钥密码（可选，使用 Secret 包装）
    #[serde(default)]
    pub key_passphrase: Option<Secret<String>>,
    /// 登录密码（可选，设置后优先于私钥）
    #[serde(default)]
    pub password: Option<Secret<String>>,
    /// 连接超时（秒），包含握手和认证
    pub connect_timeout_secs: u64,
    /// 主机密钥验证策略（strict/accept/disabled）
    pub host_key_verification: String,
    /// 主机密钥指纹（sha256 hex），strict 模式必填
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

/// 会话池配置
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// 最大会话数
    pub max_connections: usize,
}

/// 命令执行配置
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// 默认命令超时（秒）
    pub default_timeout_secs: u64,
}

/// 运维面板配置（远程目录与容器名）
#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    /// 项目部署目录
    pub remote_dir: String,
    /// 备份目录
    pub backup_dir: String,
    /// 后端容器名
    pub backend_container: String,
    /// 前端容器名
    pub frontend_container: String,
    /// 镜像名过滤关键字
    pub image_filter: String,
    /// 诊断时期望处于监听状态的端口
    pub expected_ports: Vec<u16>,
    /// 状态快照缓存时间（秒），0 表示不缓存
    pub status_cache_ttl_secs: u64,
}

/// SSH 隧道（本地端口转发）
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// 本地监听地址
    pub bind_addr: String,
    /// 转发规则，`本地端口:远程端口` 或 `本地端口:远程主机:远程端口`
    pub forwards: Vec<String>,
}

impl TunnelConfig {
    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::Message(format!("Invalid tunnel.bind_addr: {}", self.bind_addr)))
    }

    pub fn to_specs(&self) -> Result<Vec<ForwardSpec>, ConfigError> {
        self.forwards
            .iter()
            .map(|forward| forward.parse::<ForwardSpec>().map_err(ConfigError::Message))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub remote: RemoteConfig,
    pub pool: PoolConfig,
    pub command: CommandConfig,
    pub panel: PanelConfig,
    pub tunnel: TunnelConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:8800")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("remote.port", 22)?
            .set_default("remote.username", "root")?
            .set_default("remote.key_path", "~/.ssh/id_rsa")?
            .set_default("remote.connect_timeout_secs", 10)?
            .set_default("remote.host_key_verification", "accept")?
            .set_default("pool.max_connections", 5)?
            .set_default("command.default_timeout_secs", 60)?
            .set_default("panel.remote_dir", "/opt/nofx")?
            .set_default("panel.backup_dir", "/opt/nofx_backups")?
            .set_default("panel.backend_container", "nofx-trading")?
            .set_default("panel.frontend_container", "nofx-frontend")?
            .set_default("panel.image_filter", "nofx")?
            .set_default("panel.expected_ports", vec![3000, 8080])?
            .set_default("panel.status_cache_ttl_secs", 5)?
            .set_default("tunnel.bind_addr", "127.0.0.1")?
            .set_default("tunnel.forwards", vec!["3333:3000", "8888:8080"])?;

        // 从环境变量加载配置（前缀为 OPS_）
        settings = settings.add_source(
            Environment::with_prefix("OPS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.allowed_origins")
                .with_list_parse_key("panel.expected_ports")
                .with_list_parse_key("tunnel.forwards")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        if self.remote.host.trim().is_empty() {
            return Err(ConfigError::Message("remote.host must not be empty".to_string()));
        }

        if self.remote.connect_timeout_secs == 0 || self.remote.connect_timeout_secs > 300 {
            return Err(ConfigError::Message(
                "remote.connect_timeout_secs must be between 1 and 300".to_string(),
            ));
        }

        let verification = self
            .remote
            .host_key_verification
            .parse::<HostKeyVerification>()
            .map_err(ConfigError::Message)?;

        if verification == HostKeyVerification::Strict && self.remote.host_key_fingerprint.is_none()
        {
            return Err(ConfigError::Message(
                "remote.host_key_fingerprint is required when host_key_verification=strict"
                    .to_string(),
            ));
        }

        // 验证会话池配置
        if self.pool.max_connections < 1 || self.pool.max_connections > 64 {
            return Err(ConfigError::Message(
                "pool.max_connections must be between 1 and 64".to_string(),
            ));
        }

        if self.command.default_timeout_secs < 1 || self.command.default_timeout_secs > 3600 {
            return Err(ConfigError::Message(
                "command.default_timeout_secs must be between 1 and 3600".to_string(),
            ));
        }

        self.tunnel.bind_ip()?;
        self.tunnel.to_specs()?;

        Ok(())
    }

    /// 默认命令超时
    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_secs(self.command.default_timeout_secs)
    }
}

impl RemoteConfig {
    /// 构建进程级的远程目标描述
    pub fn to_target(&self) -> Result<RemoteTarget, ConfigError> {
        let host_key_verification = self
            .host_key_verification
            .parse::<HostKeyVerification>()
            .map_err(ConfigError::Message)?;

        let auth = match &self.password {
            Some(password) => SshAuth::Password(password.clone()),
            None => SshAuth::KeyFile {
                path: expand_home(&self.key_path),
                passphrase: self.key_passphrase.clone(),
            },
        };

        Ok(RemoteTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            host_key_verification,
            host_key_fingerprint: self.host_key_fingerprint.as_ref().map(|f| f.to_lowercase()),
        })
    }
}

/// 展开 `~/` 前缀
fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}
