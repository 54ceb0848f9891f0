//! SSH 隧道：把本地端口转发到远程主机（direct-tcpip 通道）
//!
//! 隧道使用独立的长连接，不占用会话池名额。每条转发规则一个监听任务，
//! 每个本地连接打开一个 direct-tcpip 通道并双向拷贝数据。

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::session::{Connector, RemoteSession};

/// 转发规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// 本地监听端口，0 表示由系统分配
    pub local_port: u16,
    /// 远程端看到的目标主机
    pub remote_host: String,
    pub remote_port: u16,
}

impl FromStr for ForwardSpec {
    type Err = String;

    /// `3333:3000` 或 `9000:db:5432`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |value: &str| {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid tunnel forward '{}': bad port '{}'", s, value))
        };

        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [local, remote] => Ok(Self {
                local_port: parse_port(local)?,
                remote_host: "127.0.0.1".to_string(),
                remote_port: parse_port(remote)?,
            }),
            [local, host, remote] if !host.trim().is_empty() => Ok(Self {
                local_port: parse_port(local)?,
                remote_host: host.trim().to_string(),
                remote_port: parse_port(remote)?,
            }),
            _ => Err(format!(
                "Invalid tunnel forward '{}': expected LOCAL:REMOTE or LOCAL:HOST:REMOTE",
                s
            )),
        }
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// 转发通道上的字节流
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// 能打开 direct-tcpip 通道的会话
#[async_trait]
pub trait ForwardSession: RemoteSession {
    async fn open_forward(
        &mut self,
        remote_host: &str,
        remote_port: u16,
        origin: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, SshError>;
}

#[derive(Default)]
struct ForwardCounters {
    total: AtomicU64,
    active: AtomicUsize,
    failed: AtomicU64,
}

/// 连接结束（包括任务被中止）时减少活跃计数
struct ActiveConnection(Arc<ForwardCounters>);

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 单条转发规则的状态
#[derive(Debug, Clone, Serialize)]
pub struct ForwardStatus {
    pub local: String,
    pub remote: String,
    pub connections_total: u64,
    pub connections_active: usize,
    pub failed: u64,
}

/// 隧道状态
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub forwards: Vec<ForwardStatus>,
}

struct ActiveForward {
    local_addr: SocketAddr,
    spec: ForwardSpec,
    counters: Arc<ForwardCounters>,
}

struct ActiveTunnel<S> {
    session: Arc<Mutex<S>>,
    started_at: DateTime<Utc>,
    forwards: Vec<ActiveForward>,
    listeners: JoinSet<()>,
}

/// 隧道管理：启动、停止、查询
pub struct TunnelManager<C: Connector>
where
    C::Session: ForwardSession,
{
    connector: Arc<C>,
    bind_ip: IpAddr,
    specs: Vec<ForwardSpec>,
    active: Mutex<Option<ActiveTunnel<C::Session>>>,
}

impl<C: Connector> TunnelManager<C>
where
    C::Session: ForwardSession,
{
    pub fn new(connector: Arc<C>, bind_ip: IpAddr, specs: Vec<ForwardSpec>) -> Self {
        Self {
            connector,
            bind_ip,
            specs,
            active: Mutex::new(None),
        }
    }

    /// 启动隧道；已在运行时直接返回当前状态
    pub async fn start(&self) -> Result<TunnelStatus, SshError> {
        let mut active = self.active.lock().await;

        if let Some(tunnel) = active.as_ref() {
            if tunnel.session.lock().await.is_alive() {
                info!("Tunnel already running");
                return Ok(self.describe(Some(tunnel), true));
            }
        }

        // 断开的旧隧道先清理，释放本地端口
        if let Some(stale) = active.take() {
            warn!("Tunnel connection lost, restarting");
            shutdown_tunnel(stale).await;
        }

        let session = Arc::new(Mutex::new(self.connector.connect().await?));
        let mut listeners = JoinSet::new();
        let mut forwards = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            let listener = match TcpListener::bind((self.bind_ip, spec.local_port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    listeners.shutdown().await;
                    close_session(session).await;
                    return Err(SshError::Connection(format!(
                        "cannot listen on {}:{}: {}",
                        self.bind_ip, spec.local_port, e
                    )));
                }
            };

            let local_addr = listener
                .local_addr()
                .unwrap_or_else(|_| SocketAddr::new(self.bind_ip, spec.local_port));
            let counters = Arc::new(ForwardCounters::default());

            info!(local = %local_addr, remote_host = %spec.remote_host, remote_port = spec.remote_port, "Tunnel forward listening");
            listeners.spawn(accept_loop(
                listener,
                spec.clone(),
                Arc::downgrade(&session),
                Arc::clone(&counters),
            ));

            forwards.push(ActiveForward {
                local_addr,
                spec: spec.clone(),
                counters,
            });
        }

        let tunnel = ActiveTunnel {
            session,
            started_at: Utc::now(),
            forwards,
            listeners,
        };
        let status = self.describe(Some(&tunnel), true);
        *active = Some(tunnel);

        Ok(status)
    }

    /// 停止隧道，返回停止前是否在运行
    pub async fn stop(&self) -> bool {
        let tunnel = self.active.lock().await.take();

        match tunnel {
            Some(tunnel) => {
                shutdown_tunnel(tunnel).await;
                info!("Tunnel stopped");
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> TunnelStatus {
        let active = self.active.lock().await;

        match active.as_ref() {
            Some(tunnel) => {
                let alive = tunnel.session.lock().await.is_alive();
                self.describe(Some(tunnel), alive)
            }
            None => self.describe(None, false),
        }
    }

    fn describe(&self, tunnel: Option<&ActiveTunnel<C::Session>>, running: bool) -> TunnelStatus {
        let forwards = match tunnel {
            Some(tunnel) => tunnel
                .forwards
                .iter()
                .map(|forward| ForwardStatus {
                    local: forward.local_addr.to_string(),
                    remote: format!("{}:{}", forward.spec.remote_host, forward.spec.remote_port),
                    connections_total: forward.counters.total.load(Ordering::SeqCst),
                    connections_active: forward.counters.active.load(Ordering::SeqCst),
                    failed: forward.counters.failed.load(Ordering::SeqCst),
                })
                .collect(),
            None => self
                .specs
                .iter()
                .map(|spec| ForwardStatus {
                    local: SocketAddr::new(self.bind_ip, spec.local_port).to_string(),
                    remote: format!("{}:{}", spec.remote_host, spec.remote_port),
                    connections_total: 0,
                    connections_active: 0,
                    failed: 0,
                })
                .collect(),
        };

        TunnelStatus {
            running,
            started_at: tunnel.map(|t| t.started_at),
            forwards,
        }
    }
}

async fn shutdown_tunnel<S: ForwardSession>(mut tunnel: ActiveTunnel<S>) {
    // 中止监听任务，其中的连接任务随之中止
    tunnel.listeners.shutdown().await;
    close_session(tunnel.session).await;
}

async fn close_session<S: RemoteSession>(session: Arc<Mutex<S>>) {
    match Arc::try_unwrap(session) {
        Ok(session) => session.into_inner().close().await,
        Err(_) => debug!("Tunnel session still referenced, dropping"),
    }
}

/// 任务只持有弱引用，停止时会话可以被取回并关闭
async fn accept_loop<S: ForwardSession>(
    listener: TcpListener,
    spec: ForwardSpec,
    session: Weak<Mutex<S>>,
    counters: Arc<ForwardCounters>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    counters.total.fetch_add(1, Ordering::SeqCst);
                    counters.active.fetch_add(1, Ordering::SeqCst);
                    let guard = ActiveConnection(Arc::clone(&counters));
                    connections.spawn(forward_connection(
                        socket,
                        peer,
                        spec.clone(),
                        Weak::clone(&session),
                        guard,
                    ));
                }
                Err(e) => {
                    warn!(local_port = spec.local_port, error = %e, "Tunnel accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn forward_connection<S: ForwardSession>(
    mut socket: TcpStream,
    peer: SocketAddr,
    spec: ForwardSpec,
    session: Weak<Mutex<S>>,
    guard: ActiveConnection,
) {
    let opened = match session.upgrade() {
        Some(session) => {
            let mut session = session.lock().await;
            session
                .open_forward(&spec.remote_host, spec.remote_port, peer)
                .await
        }
        None => Err(SshError::Connection("tunnel stopped".to_string())),
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            guard.0.failed.fetch_add(1, Ordering::SeqCst);
            warn!(peer = %peer, forward = %spec, error = %e, "Failed to open tunnel channel");
            drop(guard);
            drop(socket);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        Ok((sent, received)) => {
            debug!(peer = %peer, forward = %spec, sent, received, "Tunnel connection closed")
        }
        Err(e) => debug!(peer = %peer, forward = %spec, error = %e, "Tunnel connection ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::ExecOutput;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// 直接连接本机目标端口的会话
    struct LoopbackSession {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteSession for LoopbackSession {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn exec(&mut self, _command: &str) -> Result<ExecOutput, SshError> {
            Ok(ExecOutput::default())
        }

        async fn exec_with_input(&mut self, _command: &str, _input: &[u8]) -> Result<ExecOutput, SshError> {
            Ok(ExecOutput::default())
        }

        async fn close(self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ForwardSession for LoopbackSession {
        async fn open_forward(
            &mut self,
            remote_host: &str,
            remote_port: u16,
            _origin: SocketAddr,
        ) -> Result<Box<dyn ForwardStream>, SshError> {
            let stream = TcpStream::connect((remote_host, remote_port))
                .await
                .map_err(|e| SshError::CommandFailed(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }

    #[derive(Default)]
    struct LoopbackConnector {
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
        alive: Mutex<Vec<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl Connector for Arc<LoopbackConnector> {
        type Session = LoopbackSession;

        async fn connect(&self) -> Result<LoopbackSession, SshError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            self.alive.lock().await.push(Arc::clone(&alive));
            Ok(LoopbackSession {
                alive,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        port
    }

    fn manager(
        connector: &Arc<LoopbackConnector>,
        specs: Vec<ForwardSpec>,
    ) -> TunnelManager<Arc<LoopbackConnector>> {
        TunnelManager::new(
            Arc::new(Arc::clone(connector)),
            IpAddr::from([127, 0, 0, 1]),
            specs,
        )
    }

    #[test]
    fn test_forward_spec_parse() {
        let spec: ForwardSpec = "3333:3000".parse().unwrap();
        assert_eq!(spec.local_port, 3333);
        assert_eq!(spec.remote_host, "127.0.0.1");
        assert_eq!(spec.remote_port, 3000);

        let spec: ForwardSpec = "9000:db:5432".parse().unwrap();
        assert_eq!(spec.remote_host, "db");
        assert_eq!(spec.to_string(), "9000:db:5432");

        assert!("3000".parse::<ForwardSpec>().is_err());
        assert!("a:3000".parse::<ForwardSpec>().is_err());
        assert!("1:2:3:4".parse::<ForwardSpec>().is_err());
    }

    #[tokio::test]
    async fn test_tunnel_forwards_traffic() {
        let echo_port = echo_server().await;
        let connector = Arc::new(LoopbackConnector::default());
        let tunnel = manager(
            &connector,
            vec![ForwardSpec {
                local_port: 0,
                remote_host: "127.0.0.1".to_string(),
                remote_port: echo_port,
            }],
        );

        let status = tunnel.start().await.unwrap();
        assert!(status.running);
        let local: SocketAddr = status.forwards[0].local.parse().unwrap();

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let status = tunnel.status().await;
        assert_eq!(status.forwards[0].connections_total, 1);
        assert_eq!(status.forwards[0].remote, format!("127.0.0.1:{}", echo_port));

        assert!(tunnel.stop().await);
        assert!(!tunnel.status().await.running);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert!(TcpStream::connect(local).await.is_err());
        assert!(!tunnel.stop().await);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let connector = Arc::new(LoopbackConnector::default());
        let tunnel = manager(&connector, vec!["0:9".parse().unwrap()]);

        tunnel.start().await.unwrap();
        tunnel.start().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // 连接断开后再次启动会重连
        for alive in connector.alive.lock().await.iter() {
            alive.store(false, Ordering::SeqCst);
        }
        assert!(!tunnel.status().await.running);
        assert!(tunnel.start().await.unwrap().running);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        tunnel.stop().await;
    }

    #[tokio::test]
    async fn test_failed_channel_is_counted() {
        // 目标端口无人监听
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let connector = Arc::new(LoopbackConnector::default());
        let tunnel = manager(
            &connector,
            vec![ForwardSpec {
                local_port: 0,
                remote_host: "127.0.0.1".to_string(),
                remote_port: dead_port,
            }],
        );

        let status = tunnel.start().await.unwrap();
        let local: SocketAddr = status.forwards[0].local.parse().unwrap();

        let mut client = TcpStream::connect(local).await.unwrap();
        let mut buf = Vec::new();
        // 通道打开失败后本地连接被关闭
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        let status = tunnel.status().await;
        assert_eq!(status.forwards[0].failed, 1);
        assert_eq!(status.forwards[0].connections_active, 0);

        tunnel.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_start() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let connector = Arc::new(LoopbackConnector::default());
        let tunnel = manager(&connector, vec![format!("{}:80", port).parse().unwrap()]);

        let err = tunnel.start().await.unwrap_err();
        assert!(matches!(err, SshError::Connection(_)));
        assert!(!tunnel.status().await.running);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }
}
