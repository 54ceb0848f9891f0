//! 基于 russh 的会话实现
//!
//! [`RusshConnector`] 负责建立连接、验证主机密钥和认证；
//! [`RusshSession`] 在一个已认证的连接上为每条命令打开独立通道。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use russh_keys::load_secret_key;
use russh_keys::PublicKeyBase64;
use secrecy::ExposeSecret;
use sha2::Digest;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::error::SshError;
use super::session::{Connector, ExecOutput, RemoteSession};
use super::target::{HostKeyVerification, RemoteTarget, SshAuth};
use super::tunnel::{ForwardSession, ForwardStream};

/// russh 连接工厂
pub struct RusshConnector {
    target: Arc<RemoteTarget>,
    client_config: Arc<Config>,
    /// accept 模式下首次连接记住的指纹，所有会话共享
    pinned_fingerprint: Arc<Mutex<Option<String>>>,
}

impl RusshConnector {
    pub fn new(target: RemoteTarget) -> Self {
        let client_config = Arc::new(Config {
            preferred: russh::Preferred::default(),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        Self {
            pinned_fingerprint: Arc::new(Mutex::new(target.host_key_fingerprint.clone())),
            target: Arc::new(target),
            client_config,
        }
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn handler(&self) -> ClientHandler {
        ClientHandler {
            verification: self.target.host_key_verification,
            expected: self.target.host_key_fingerprint.clone(),
            pinned: Arc::clone(&self.pinned_fingerprint),
            host: format!("{}:{}", self.target.host, self.target.port),
        }
    }

    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<(), SshError> {
        let username = self.target.username.clone();

        let accepted = match &self.target.auth {
            SshAuth::Password(password) => handle
                .authenticate_password(username, password.expose_secret().as_str())
                .await
                .map_err(|e| SshError::Connection(format!("authentication exchange failed: {}", e)))?,
            SshAuth::KeyFile { path, passphrase } => {
                let key = load_secret_key(
                    path,
                    passphrase.as_ref().map(|p| p.expose_secret().as_str()),
                )
                .map_err(|e| {
                    error!(path = %path.display(), error = %e, "Failed to load SSH private key");
                    SshError::AuthenticationFailed(format!(
                        "cannot load key {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                handle
                    .authenticate_publickey(username, Arc::new(key))
                    .await
                    .map_err(|e| {
                        SshError::Connection(format!("authentication exchange failed: {}", e))
                    })?
            }
        };

        if !accepted {
            error!(target = %self.target.address(), "SSH authentication rejected");
            return Err(SshError::AuthenticationFailed(format!(
                "credentials rejected for {}",
                self.target.address()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Connector for RusshConnector {
    type Session = RusshSession;

    async fn connect(&self) -> Result<RusshSession, SshError> {
        let target = &self.target;
        debug!(target = %target.address(), "Opening SSH connection");

        let connect = async {
            let mut handle = client::connect(
                Arc::clone(&self.client_config),
                (target.host.clone(), target.port),
                self.handler(),
            )
            .await
            .map_err(|e| {
                error!(target = %target.address(), error = %e, "SSH connection failed");
                SshError::Connection(format!("{}: {}", target.address(), e))
            })?;

            self.authenticate(&mut handle).await?;
            Ok::<_, SshError>(handle)
        };

        let handle = timeout(target.connect_timeout, connect).await.map_err(|_| {
            SshError::Connection(format!(
                "timed out after {}s connecting to {}",
                target.connect_timeout.as_secs(),
                target.address()
            ))
        })??;

        info!(target = %target.address(), "SSH session authenticated");
        Ok(RusshSession { handle })
    }
}

/// 已认证的 russh 连接
pub struct RusshSession {
    handle: client::Handle<ClientHandler>,
}

impl RusshSession {
    async fn run_channel(&mut self, command: &str, input: Option<&[u8]>) -> Result<ExecOutput, SshError> {
        let mut channel = self.handle.channel_open_session().await.map_err(|e| {
            error!(error = %e, "Failed to open SSH channel");
            SshError::CommandFailed(format!("cannot open channel: {}", e))
        })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::CommandFailed(format!("exec request failed: {}", e)))?;

        if let Some(input) = input {
            channel
                .data(input)
                .await
                .map_err(|e| SshError::CommandFailed(format!("writing stdin failed: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| SshError::CommandFailed(format!("sending EOF failed: {}", e)))?;
        }

        let mut output = ExecOutput::default();
        let mut exit_status = None;

        // 读到远端关闭通道为止，退出码之后可能仍有数据
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                // SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code as i32),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    warn!(signal = ?signal_name, "Remote command terminated by signal");
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        output.exit_status = exit_status.ok_or_else(|| {
            SshError::CommandFailed("channel closed without an exit status".to_string())
        })?;

        Ok(output)
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError> {
        self.run_channel(command, None).await
    }

    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput, SshError> {
        self.run_channel(command, Some(input)).await
    }

    async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

#[async_trait]
impl ForwardSession for RusshSession {
    async fn open_forward(
        &mut self,
        remote_host: &str,
        remote_port: u16,
        origin: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, SshError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
            .map_err(|e| {
                SshError::CommandFailed(format!(
                    "direct-tcpip to {}:{} rejected: {}",
                    remote_host, remote_port, e
                ))
            })?;

        Ok(Box::new(channel.into_stream()))
    }
}

/// 主机密钥验证
struct ClientHandler {
    verification: HostKeyVerification,
    expected: Option<String>,
    pinned: Arc<Mutex<Option<String>>>,
    host: String,
}

/// sha256(base64 公钥) 的 hex 编码
fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(key.public_key_base64().as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);

        match self.verification {
            HostKeyVerification::Disabled => {
                warn!(host = %self.host, "Host key verification DISABLED - accepting all keys");
                Ok(true)
            }
            HostKeyVerification::Strict => {
                let accepted = self.expected.as_deref() == Some(actual.as_str());
                if !accepted {
                    error!(
                        host = %self.host,
                        expected = ?self.expected,
                        actual = %actual,
                        "Host key mismatch - REJECTING CONNECTION"
                    );
                }
                Ok(accepted)
            }
            HostKeyVerification::Accept => {
                let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
                match pinned.as_deref() {
                    Some(known) if known == actual => {
                        debug!(host = %self.host, "Host key verified");
                        Ok(true)
                    }
                    Some(known) => {
                        error!(
                            host = %self.host,
                            expected = %known,
                            actual = %actual,
                            "Host key mismatch - POSSIBLE SECURITY BREACH"
                        );
                        Ok(false)
                    }
                    None => {
                        info!(host = %self.host, fingerprint = %actual, "First time connecting - pinning host key");
                        *pinned = Some(actual);
                        Ok(true)
                    }
                }
            }
        }
    }
}
