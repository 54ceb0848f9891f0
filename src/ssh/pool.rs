//! SSH 会话池
//!
//! 会话分为 idle 与 in-use 两个集合，总数（含正在建立的连接）不超过
//! `max_connections`。获取时先扫描空闲会话并做存活探测，死会话直接丢弃；
//! 没有可用会话且未达上限时新建，已达上限立即返回 [`SshError::PoolExhausted`]
//! （不排队）。
//!
//! 所有集合操作都在同一把 `std::sync::Mutex` 下完成，锁不会跨越 `.await`。

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::session::{Connector, ExecOutput, RemoteSession};

/// 会话编号（池内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh-{}", self.0)
    }
}

/// 会话池状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    /// 已预留名额、正在建立的连接
    pub connecting: usize,
    pub max_connections: usize,
}

impl PoolStats {
    /// 当前占用的名额总数
    pub fn total(&self) -> usize {
        self.idle + self.in_use + self.connecting
    }
}

struct IdleSession<S> {
    id: SessionId,
    session: S,
}

struct PoolState<S> {
    idle: Vec<IdleSession<S>>,
    in_use: HashSet<SessionId>,
    connecting: usize,
    next_id: u64,
}

impl<S> PoolState<S> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.connecting
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }
}

struct PoolShared<S> {
    max_connections: usize,
    state: Mutex<PoolState<S>>,
}

impl<S: RemoteSession> PoolShared<S> {
    fn lock(&self) -> MutexGuard<'_, PoolState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 归还会话；不在 in-use 集合中的会话直接丢弃
    fn check_in(&self, id: SessionId, session: S) {
        let mut state = self.lock();
        if state.in_use.remove(&id) {
            state.idle.push(IdleSession { id, session });
            debug!(session_id = %id, idle = state.idle.len(), "Session returned to pool");
        } else {
            drop(state);
            debug!(session_id = %id, "Session is not checked out, dropping it");
        }
    }

    /// 移出 in-use 集合，会话不再归还
    fn forget(&self, id: SessionId) {
        self.lock().in_use.remove(&id);
        metrics::counter!("ssh_pool_sessions_discarded_total").increment(1);
    }
}

/// 锁内占用的名额，离开锁之前已由守卫持有
enum Checkout<'a, S: RemoteSession> {
    Reused(PooledSession<S>),
    Create(Reservation<'a, S>),
    Exhausted,
}

/// 新建连接期间占用的名额；未转正就被丢弃（失败或取消）时归还名额
struct Reservation<'a, S: RemoteSession> {
    shared: &'a PoolShared<S>,
    id: SessionId,
    pending: bool,
}

impl<S: RemoteSession> Reservation<'_, S> {
    fn promote(mut self) {
        let mut state = self.shared.lock();
        state.connecting -= 1;
        state.in_use.insert(self.id);
        self.pending = false;
    }
}

impl<S: RemoteSession> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if self.pending {
            let mut state = self.shared.lock();
            state.connecting -= 1;
        }
    }
}

/// 有上限的会话池
pub struct SessionPool<C: Connector> {
    connector: Arc<C>,
    shared: Arc<PoolShared<C::Session>>,
}

impl<C: Connector> Clone for SessionPool<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> SessionPool<C> {
    /// 创建会话池，`max_connections` 至少为 1
    pub fn new(connector: C, max_connections: usize) -> Self {
        Self {
            connector: Arc::new(connector),
            shared: Arc::new(PoolShared {
                max_connections: max_connections.max(1),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: HashSet::new(),
                    connecting: 0,
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// 连接工厂（隧道等不经过池的长连接共用它，共享主机密钥信任）
    pub fn connector(&self) -> Arc<C> {
        Arc::clone(&self.connector)
    }

    /// 获取会话
    ///
    /// 返回的 [`PooledSession`] 在 drop 时自动归还。
    /// future 在任何 `.await` 处被取消，占用的名额都会归还。
    pub async fn acquire(&self) -> Result<PooledSession<C::Session>, SshError> {
        let (checkout, dead) = {
            let mut state = self.shared.lock();
            let mut dead = Vec::new();
            let mut reused = None;

            while let Some(entry) = state.idle.pop() {
                if entry.session.is_alive() {
                    reused = Some(entry);
                    break;
                }
                dead.push(entry);
            }

            let checkout = if let Some(entry) = reused {
                state.in_use.insert(entry.id);
                Checkout::Reused(PooledSession::new(
                    entry.id,
                    entry.session,
                    Arc::clone(&self.shared),
                ))
            } else if state.total() < self.shared.max_connections {
                state.connecting += 1;
                Checkout::Create(Reservation {
                    shared: &self.shared,
                    id: state.allocate_id(),
                    pending: true,
                })
            } else {
                Checkout::Exhausted
            };

            (checkout, dead)
        };

        self.discard_dead(dead).await;

        match checkout {
            Checkout::Reused(session) => {
                debug!(session_id = %session.id, "Reusing idle SSH session");
                Ok(session)
            }
            Checkout::Create(reservation) => self.create(reservation).await,
            Checkout::Exhausted => {
                metrics::counter!("ssh_pool_exhausted_total").increment(1);
                warn!(max_connections = self.shared.max_connections, "SSH session pool exhausted");
                Err(SshError::PoolExhausted {
                    max: self.shared.max_connections,
                })
            }
        }
    }

    /// 归还会话（与直接 drop 等价）
    pub fn release(&self, session: PooledSession<C::Session>) {
        session.release();
    }

    /// 关闭所有空闲会话并清空两个集合
    ///
    /// 此时仍被借出的会话在归还时会被直接丢弃。
    pub async fn shutdown(&self) {
        let (idle, abandoned) = {
            let mut state = self.shared.lock();
            let idle = std::mem::take(&mut state.idle);
            let abandoned = state.in_use.len();
            state.in_use.clear();
            (idle, abandoned)
        };

        info!(
            closing = idle.len(),
            checked_out = abandoned,
            "Shutting down SSH session pool"
        );

        for entry in idle {
            entry.session.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            connecting: state.connecting,
            max_connections: self.shared.max_connections,
        }
    }

    async fn create(
        &self,
        reservation: Reservation<'_, C::Session>,
    ) -> Result<PooledSession<C::Session>, SshError> {
        let id = reservation.id;

        match self.connector.connect().await {
            Ok(session) => {
                reservation.promote();
                metrics::counter!("ssh_pool_sessions_created_total").increment(1);
                info!(session_id = %id, "SSH session created");
                Ok(PooledSession::new(id, session, Arc::clone(&self.shared)))
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to create SSH session");
                Err(e)
            }
        }
    }

    async fn discard_dead(&self, dead: Vec<IdleSession<C::Session>>) {
        if dead.is_empty() {
            return;
        }

        metrics::counter!("ssh_pool_sessions_discarded_total").increment(dead.len() as u64);
        for entry in dead {
            warn!(session_id = %entry.id, "SSH session failed liveness check, discarding");
            entry.session.close().await;
        }
    }

    #[cfg(test)]
    fn snapshot_ids(&self) -> (Vec<SessionId>, Vec<SessionId>) {
        let state = self.shared.lock();
        (
            state.idle.iter().map(|e| e.id).collect(),
            state.in_use.iter().copied().collect(),
        )
    }
}

/// 借出的会话
///
/// 命令执行期间被 drop（调用方的 future 被取消）时，会话不归还，
/// 在后台关闭。
pub struct PooledSession<S: RemoteSession> {
    id: SessionId,
    session: Option<S>,
    shared: Arc<PoolShared<S>>,
    in_flight: bool,
}

impl<S: RemoteSession> PooledSession<S> {
    fn new(id: SessionId, session: S, shared: Arc<PoolShared<S>>) -> Self {
        Self {
            id,
            session: Some(session),
            shared,
            in_flight: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.session.as_ref().is_some_and(RemoteSession::is_alive)
    }

    pub async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError> {
        self.exec_inner(command, None).await
    }

    /// 执行命令并把 `input` 写入远端标准输入
    pub async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput, SshError> {
        self.exec_inner(command, Some(input)).await
    }

    async fn exec_inner(&mut self, command: &str, input: Option<&[u8]>) -> Result<ExecOutput, SshError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SshError::CommandFailed("session already released".to_string()));
        };

        self.in_flight = true;
        let result = match input {
            Some(input) => session.exec_with_input(command, input).await,
            None => session.exec(command).await,
        };
        self.in_flight = false;

        result
    }

    /// 归还到池中
    pub fn release(self) {}

    /// 不再复用：移出 in-use 集合并关闭
    ///
    /// 命令超时或通道出错后连接状态不可信，调用方应丢弃而不是归还。
    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.shared.forget(self.id);
            debug!(session_id = %self.id, "Discarding SSH session");
            session.close().await;
        }
    }
}

impl<S: RemoteSession> Drop for PooledSession<S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if !self.in_flight {
            self.shared.check_in(self.id, session);
            return;
        }

        // 远端命令可能仍在运行
        self.shared.forget(self.id);
        warn!(session_id = %self.id, "Command cancelled mid-execution, discarding SSH session");
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(session.close());
            }
            Err(_) => drop(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeSession {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        close_delay: Option<Duration>,
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn exec(&mut self, command: &str) -> Result<ExecOutput, SshError> {
            if command == "sleep" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(ExecOutput {
                stdout: command.as_bytes().to_vec(),
                stderr: Vec::new(),
                exit_status: 0,
            })
        }

        async fn exec_with_input(&mut self, _command: &str, input: &[u8]) -> Result<ExecOutput, SshError> {
            Ok(ExecOutput {
                stdout: input.to_vec(),
                stderr: Vec::new(),
                exit_status: 0,
            })
        }

        async fn close(self) {
            if let Some(delay) = self.close_delay {
                tokio::time::sleep(delay).await;
            }
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
        connect_delay: Option<Duration>,
        close_delay: Option<Duration>,
        handles: Mutex<Vec<(Arc<AtomicBool>, Arc<AtomicBool>)>>,
    }

    impl FakeConnector {
        fn kill_all(&self) {
            for (alive, _) in self.handles.lock().unwrap().iter() {
                alive.store(false, Ordering::SeqCst);
            }
        }

        fn closed_count(&self) -> usize {
            self.handles
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, closed)| closed.load(Ordering::SeqCst))
                .count()
        }
    }

    #[async_trait]
    impl Connector for Arc<FakeConnector> {
        type Session = FakeSession;

        async fn connect(&self) -> Result<FakeSession, SshError> {
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SshError::AuthenticationFailed("key rejected".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            let closed = Arc::new(AtomicBool::new(false));
            self.handles.lock().unwrap().push((alive.clone(), closed.clone()));
            Ok(FakeSession {
                alive,
                closed,
                close_delay: self.close_delay,
            })
        }
    }

    fn pool(max: usize) -> (SessionPool<Arc<FakeConnector>>, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        (SessionPool::new(connector.clone(), max), connector)
    }

    fn assert_invariants(pool: &SessionPool<Arc<FakeConnector>>) {
        let stats = pool.stats();
        assert!(stats.total() <= stats.max_connections, "{:?}", stats);
        let (idle, in_use) = pool.snapshot_ids();
        for id in &idle {
            assert!(!in_use.contains(id), "{} is both idle and in use", id);
        }
    }

    #[tokio::test]
    async fn test_idle_session_is_reused() {
        let (pool, connector) = pool(3);

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        pool.release(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_when_single_session_in_use() {
        let (pool, _) = pool(1);

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, SshError::PoolExhausted { max: 1 }));

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_session_replaced() {
        let (pool, connector) = pool(2);

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        drop(first);

        connector.kill_all();

        let second = pool.acquire().await.unwrap();
        assert_ne!(second.id(), first_id);
        assert!(second.is_alive());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.closed_count(), 1);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_release_after_shutdown_is_noop() {
        let (pool, connector) = pool(2);

        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        drop(idle);

        pool.shutdown().await;
        assert_eq!(connector.closed_count(), 1);

        pool.release(held);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_discarded_session_frees_slot() {
        let (pool, connector) = pool(1);

        let session = pool.acquire().await.unwrap();
        let id = session.id();
        session.discard().await;

        assert_eq!(pool.stats().total(), 0);
        assert_eq!(connector.closed_count(), 1);
        assert_ne!(pool.acquire().await.unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_slot() {
        let (pool, connector) = pool(1);
        connector.fail.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
        assert_eq!(pool.stats().total(), 0);

        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_slot() {
        let connector = Arc::new(FakeConnector {
            connect_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let pool = SessionPool::new(connector, 1);

        let result = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(result.is_err());
        assert_eq!(pool.stats().connecting, 0);
        assert_eq!(pool.stats().total(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_closing_dead_session_returns_slot() {
        let connector = Arc::new(FakeConnector {
            close_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let pool = SessionPool::new(connector.clone(), 1);

        drop(pool.acquire().await.unwrap());
        connector.kill_all();

        // 新建名额已占用，死会话关闭期间被取消
        let result = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(result.is_err());
        assert_eq!(pool.stats().total(), 0);

        assert!(pool.acquire().await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_while_closing_dead_session_keeps_reused_session() {
        let connector = Arc::new(FakeConnector {
            close_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let pool = SessionPool::new(connector.clone(), 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let first_id = first.id();
        drop(first);
        drop(second);

        // 后归还的先被取出：它已断开，随后复用第一个
        connector.handles.lock().unwrap()[1].0.store(false, Ordering::SeqCst);

        let result = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(result.is_err());

        let stats = pool.stats();
        assert_eq!((stats.idle, stats.in_use, stats.connecting), (1, 0, 0));
        assert_eq!(pool.acquire().await.unwrap().id(), first_id);
    }

    #[tokio::test]
    async fn test_cancelled_exec_discards_session() {
        let (pool, connector) = pool(1);

        let mut session = pool.acquire().await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), session.exec("sleep")).await;
        assert!(result.is_err());
        drop(session);

        assert_eq!(pool.stats().total(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.closed_count(), 1);

        // 完成的命令不影响归还
        let mut session = pool.acquire().await.unwrap();
        assert_eq!(session.exec_with_input("cat", b"abc").await.unwrap().stdout, b"abc");
        drop(session);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_invariants_hold_across_sequences() {
        let (pool, connector) = pool(3);
        let mut held = Vec::new();

        for round in 0..40 {
            match round % 7 {
                0 | 1 | 3 => {
                    if let Ok(session) = pool.acquire().await {
                        held.push(session);
                    }
                }
                2 | 4 => {
                    if !held.is_empty() {
                        pool.release(held.remove(0));
                    }
                }
                5 => connector.kill_all(),
                _ => {
                    while let Some(session) = held.pop() {
                        pool.release(session);
                    }
                }
            }
            assert_invariants(&pool);
        }
    }
}
