//! 会话抽象
//!
//! 会话池只依赖这两个 trait，真实实现见 [`crate::ssh::client`]。

use async_trait::async_trait;

use super::error::SshError;

/// 单条命令的原始输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

/// 已认证的远程会话
///
/// 会话本身不要求线程安全，池的 in-use 标记保证同一时刻只有一个持有者。
#[async_trait]
pub trait RemoteSession: Send + Sized + 'static {
    /// 存活探测：底层传输是否仍然可用
    fn is_alive(&self) -> bool;

    /// 执行命令，读取到远端关闭通道为止
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError>;

    /// 执行命令，`input` 写入远端标准输入后发送 EOF
    ///
    /// 大块内容走这里，不要拼进命令行（单个参数受 `MAX_ARG_STRLEN` 限制）。
    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput, SshError>;

    /// 关闭会话（尽力而为）
    async fn close(self);
}

/// 会话工厂
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: RemoteSession;

    /// 建立并认证一个新会话
    async fn connect(&self) -> Result<Self::Session, SshError>;
}
