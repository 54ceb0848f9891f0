//! SSH执行模块
//! 会话池 + 命令执行器 + 端口转发隧道，底层使用 russh

pub mod client;
pub mod error;
pub mod executor;
pub mod pool;
pub mod session;
pub mod target;
pub mod tunnel;

pub use client::RusshConnector;
pub use error::SshError;
pub use executor::{CommandExecutor, CommandResult, EXECUTOR_FAILURE_CODE};
pub use pool::{PoolStats, PooledSession, SessionId, SessionPool};
pub use session::{Connector, ExecOutput, RemoteSession};
pub use target::{HostKeyVerification, RemoteTarget, SshAuth};
pub use tunnel::{ForwardSession, ForwardSpec, ForwardStatus, ForwardStream, TunnelManager, TunnelStatus};
