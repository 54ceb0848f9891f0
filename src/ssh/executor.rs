//! 远程命令执行器
//!
//! 对调用方只暴露一个操作：[`CommandExecutor::run`]。它从会话池借出会话、
//! 在超时内执行命令并归还会话，任何执行器层面的失败（池耗尽、连接失败、
//! 超时）都折叠为 `exit_code == -1` 的 [`CommandResult`]，不会向上抛错。

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::RusshConnector;
use super::error::SshError;
use super::pool::{PoolStats, SessionPool};
use super::session::{Connector, ExecOutput};
use super::target::RemoteTarget;
use crate::output::{default_sanitizer, summarize};

/// 执行器层失败时的退出码
pub const EXECUTOR_FAILURE_CODE: i32 = -1;

/// 日志中输出摘要的最大长度
const LOG_SUMMARY_LEN: usize = 200;

/// 命令执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    /// 标准输出（非法 UTF-8 以替换字符解码）
    pub stdout: String,
    /// 标准错误；执行器失败时为错误描述
    pub stderr: String,
    /// 远端退出码，执行器失败时为 -1
    pub exit_code: i32,
    /// 执行时长（秒）
    pub duration_secs: f64,
    /// 是否超时
    pub timed_out: bool,
}

impl CommandResult {
    fn from_output(output: ExecOutput, duration_secs: f64) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.exit_status,
            duration_secs,
            timed_out: false,
        }
    }

    /// 执行器层失败
    pub fn executor_failure(message: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            stderr: message.into(),
            duration_secs,
            ..Default::default()
        }
    }

    /// 超时结果
    pub fn timeout(limit: Duration, duration_secs: f64) -> Self {
        Self {
            stderr: SshError::CommandTimeout(limit).to_string(),
            duration_secs,
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// 失败发生在执行器层（命令没有产生远端退出码）
    pub fn is_executor_failure(&self) -> bool {
        self.exit_code == EXECUTOR_FAILURE_CODE
    }

    /// 获取完整输出（stdout + stderr）
    pub fn full_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
    }

    /// 获取输出摘要（限制长度）
    pub fn output_summary(&self, max_len: usize) -> String {
        summarize(&self.full_output(), max_len)
    }
}

impl Default for CommandResult {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: EXECUTOR_FAILURE_CODE,
            duration_secs: 0.0,
            timed_out: false,
        }
    }
}

/// 远程命令执行器
pub struct CommandExecutor<C: Connector = RusshConnector> {
    pool: SessionPool<C>,
    default_timeout: Duration,
}

impl CommandExecutor<RusshConnector> {
    /// 针对单个远程目标创建执行器
    pub fn for_target(target: RemoteTarget, max_connections: usize, default_timeout: Duration) -> Self {
        Self::new(RusshConnector::new(target), max_connections, default_timeout)
    }
}

impl<C: Connector> CommandExecutor<C> {
    pub fn new(connector: C, max_connections: usize, default_timeout: Duration) -> Self {
        Self {
            pool: SessionPool::new(connector, max_connections),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pool(&self) -> &SessionPool<C> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// 执行远程命令
    ///
    /// `timeout` 为 `None` 时使用默认超时。永不返回错误：
    /// 执行器层失败体现为 `exit_code == -1`，错误描述放在 `stderr`。
    pub async fn run(&self, command: &str, timeout: Option<Duration>) -> CommandResult {
        self.execute(command, None, timeout).await
    }

    /// 执行远程命令，`input` 通过标准输入传给命令
    ///
    /// 用于写文件等大块内容，语义与 [`run`](Self::run) 相同。
    pub async fn run_with_input(&self, command: &str, input: &[u8], timeout: Option<Duration>) -> CommandResult {
        self.execute(command, Some(input), timeout).await
    }

    async fn execute(&self, command: &str, input: Option<&[u8]>, timeout: Option<Duration>) -> CommandResult {
        let limit = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let sanitizer = default_sanitizer();

        debug!(
            command = %sanitizer.sanitize(command),
            input_bytes = input.map_or(0, <[u8]>::len),
            timeout_secs = limit.as_secs_f64(),
            "Running remote command"
        );

        let (result, outcome) = match self.pool.acquire().await {
            Ok(mut session) => {
                let exec = match input {
                    Some(input) => tokio::time::timeout(limit, session.exec_with_input(command, input)).await,
                    None => tokio::time::timeout(limit, session.exec(command)).await,
                };
                let elapsed = started.elapsed().as_secs_f64();

                match exec {
                    Ok(Ok(output)) => {
                        session.release();
                        let result = CommandResult::from_output(output, elapsed);
                        let outcome = if result.exit_code == 0 { "success" } else { "nonzero_exit" };
                        (result, outcome)
                    }
                    Ok(Err(e)) => {
                        warn!(session_id = %session.id(), error = %e, "Remote command failed");
                        session.discard().await;
                        (CommandResult::executor_failure(e.to_string(), elapsed), e.kind())
                    }
                    Err(_) => {
                        warn!(
                            session_id = %session.id(),
                            timeout_secs = limit.as_secs_f64(),
                            "Remote command timed out"
                        );
                        session.discard().await;
                        (CommandResult::timeout(limit, elapsed), "timeout")
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "No SSH session available");
                let elapsed = started.elapsed().as_secs_f64();
                (CommandResult::executor_failure(e.to_string(), elapsed), e.kind())
            }
        };

        metrics::counter!("ssh_commands_total", "outcome" => outcome).increment(1);
        metrics::histogram!("ssh_command_duration_seconds").record(result.duration_secs);

        info!(
            exit_code = result.exit_code,
            duration_secs = result.duration_secs,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            outcome,
            "Remote command finished"
        );
        debug!(
            output = %sanitizer.sanitize(&result.output_summary(LOG_SUMMARY_LEN)),
            "Remote command output"
        );

        result
    }

    /// 使用默认超时执行
    pub async fn run_default(&self, command: &str) -> CommandResult {
        self.run(command, None).await
    }

    /// 关闭会话池
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
