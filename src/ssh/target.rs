//! 远程目标模型
//!
//! 进程级、启动后不可变的 SSH 目标描述

use std::path::PathBuf;
use std::time::Duration;

use secrecy::Secret;
use serde::{Deserialize, Serialize};

/// 主机密钥验证策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// 严格模式：只接受配置中的指纹
    Strict,
    /// 接受模式：首次连接时记住指纹，之后必须一致
    #[default]
    Accept,
    /// 禁用验证（不安全，仅用于开发/测试）
    Disabled,
}

impl std::str::FromStr for HostKeyVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept" => Ok(Self::Accept),
            "disabled" | "none" | "false" => Ok(Self::Disabled),
            _ => Err(format!("Unknown host key verification mode: {}", s)),
        }
    }
}

/// SSH 认证方式
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// 私钥文件认证
    KeyFile {
        /// 私钥文件路径
        path: PathBuf,
        /// 私钥密码（如果有）
        passphrase: Option<Secret<String>>,
    },
    /// 密码认证
    Password(Secret<String>),
}

/// 远程目标
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    /// 主机地址
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式
    pub auth: SshAuth,
    /// 连接超时（TCP + 握手 + 认证）
    pub connect_timeout: Duration,
    /// 主机密钥验证策略
    pub host_key_verification: HostKeyVerification,
    /// 预置的主机密钥指纹（sha256 hex）
    pub host_key_fingerprint: Option<String>,
}

impl RemoteTarget {
    /// 使用私钥文件创建目标
    pub fn with_key_file(host: impl Into<String>, username: impl Into<String>, path: PathBuf) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth: SshAuth::KeyFile {
                path,
                passphrase: None,
            },
            connect_timeout: Duration::from_secs(10),
            host_key_verification: HostKeyVerification::default(),
            host_key_fingerprint: None,
        }
    }

    /// 设置端口
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 设置连接超时
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置主机密钥验证策略
    pub fn with_host_key_verification(mut self, verification: HostKeyVerification) -> Self {
        self.host_key_verification = verification;
        self
    }

    /// 获取目标地址字符串
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}
