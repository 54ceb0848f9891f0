//! SSH 层错误

use std::time::Duration;

use thiserror::Error;

/// 会话池与传输层错误
#[derive(Debug, Error)]
pub enum SshError {
    /// 没有可用的空闲会话，且已达到上限
    #[error("SSH session pool exhausted (max {max} sessions)")]
    PoolExhausted { max: usize },

    /// 私钥加载失败或服务端拒绝凭据
    #[error("SSH authentication failed: {0}")]
    AuthenticationFailed(String),

    /// TCP 连接、握手失败或连接超时
    #[error("SSH connection failed: {0}")]
    Connection(String),

    #[error("Command timed out after {}s", .0.as_secs_f64())]
    CommandTimeout(Duration),

    /// 通道打开或读取失败
    #[error("Command execution failed: {0}")]
    CommandFailed(String),
}

impl SshError {
    /// 用于指标标签的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            SshError::PoolExhausted { .. } => "pool_exhausted",
            SshError::AuthenticationFailed(_) => "auth_failed",
            SshError::Connection(_) => "connection",
            SshError::CommandTimeout(_) => "timeout",
            SshError::CommandFailed(_) => "command_failed",
        }
    }
}
