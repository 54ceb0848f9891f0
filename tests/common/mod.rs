//! 测试公共模块
//! 提供可编排输出的假连接器和测试配置
#![allow(dead_code)]

use async_trait::async_trait;
use ops_panel::{
    config::{
        AppConfig, CommandConfig, LoggingConfig, PanelConfig, PoolConfig, RemoteConfig,
        ServerConfig, TunnelConfig,
    },
    middleware::AppState,
    ssh::{CommandExecutor, Connector, ExecOutput, RemoteSession, SshError},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 创建测试配置
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(), // 使用随机端口
            graceful_shutdown_timeout_secs: 5,
            allowed_origins: None,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        remote: RemoteConfig {
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "root".to_string(),
            key_path: "/nonexistent/id_rsa".to_string(),
            key_passphrase: None,
            password: None,
            connect_timeout_secs: 2,
            host_key_verification: "accept".to_string(),
            host_key_fingerprint: None,
        },
        pool: PoolConfig { max_connections: 2 },
        command: CommandConfig {
            default_timeout_secs: 5,
        },
        panel: PanelConfig {
            remote_dir: "/opt/nofx".to_string(),
            backup_dir: "/opt/nofx_backups".to_string(),
            backend_container: "nofx-trading".to_string(),
            frontend_container: "nofx-frontend".to_string(),
            image_filter: "nofx".to_string(),
            expected_ports: vec![3000, 8080],
            status_cache_ttl_secs: 0,
        },
        tunnel: TunnelConfig {
            bind_addr: "127.0.0.1".to_string(),
            forwards: vec!["0:3000".to_string()],
        },
    }
}

#[derive(Default)]
struct FakeState {
    /// (命令子串, 输出)，按插入顺序匹配
    responses: Mutex<Vec<(String, ExecOutput)>>,
    commands: Mutex<Vec<String>>,
    /// 通过标准输入传入的内容
    inputs: Mutex<Vec<Vec<u8>>>,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    alive_flags: Mutex<Vec<Arc<AtomicBool>>>,
    closed: AtomicUsize,
}

/// 假连接器
///
/// - `sleep <secs>` 命令会真实等待
/// - 包含 `fail-channel` 的命令返回通道错误
/// - 其余命令按已登记的子串返回输出，未匹配时 exit 0、无输出
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记命令输出
    pub fn respond(&self, pattern: &str, stdout: &str, stderr: &str, exit_status: i32) -> &Self {
        self.state.responses.lock().unwrap().push((
            pattern.to_string(),
            ExecOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                exit_status,
            },
        ));
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// 模拟所有已建立连接断开
    pub fn kill_sessions(&self) {
        for alive in self.state.alive_flags.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// 已执行的命令
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn last_command(&self) -> Option<String> {
        self.commands().last().cloned()
    }

    pub fn last_input(&self) -> Option<Vec<u8>> {
        self.state.inputs.lock().unwrap().last().cloned()
    }
}

pub struct FakeSession {
    state: Arc<FakeState>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError> {
        self.state.commands.lock().unwrap().push(command.to_string());

        if let Some(secs) = command.strip_prefix("sleep ") {
            let secs: f64 = secs.trim().parse().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }

        if command.contains("fail-channel") {
            return Err(SshError::CommandFailed("channel closed unexpectedly".to_string()));
        }

        let responses = self.state.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput, SshError> {
        self.state.inputs.lock().unwrap().push(input.to_vec());
        self.exec(command).await
    }

    async fn close(self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession, SshError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(SshError::Connection("connection refused".to_string()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.alive_flags.lock().unwrap().push(alive.clone());

        Ok(FakeSession {
            state: Arc::clone(&self.state),
            alive,
        })
    }
}

/// 创建使用假连接器的执行器
pub fn create_test_executor(
    connector: &FakeConnector,
    max_connections: usize,
) -> Arc<CommandExecutor<FakeConnector>> {
    Arc::new(CommandExecutor::new(
        connector.clone(),
        max_connections,
        Duration::from_secs(5),
    ))
}

/// 创建测试应用状态
pub fn create_test_app_state(connector: &FakeConnector) -> Arc<AppState<FakeConnector>> {
    let config = create_test_config();
    let executor = create_test_executor(connector, config.pool.max_connections);
    Arc::new(AppState::new(config, executor))
}
