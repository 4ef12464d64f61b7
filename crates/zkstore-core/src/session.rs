//! Session lifecycle management.
//!
//! A single supervisor task owns the connection to the ensemble. It opens
//! sessions through a [`Connector`], follows the connection events of the
//! current session, and reconnects with backoff when a session expires. The
//! current state is published on a `watch` channel; operations never change
//! it, they only wait on it through [`SessionManager::acquire`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, ReconnectConfig};
use crate::config::StoreConfig;
use crate::ensemble::{
    ConnectSettings, Connection, Connector, NativeCode, SessionEvent, ZnodeStat,
};
use crate::error::{ConnectionError, Result, StoreError};
use crate::health::CallHealth;
use crate::path::ZnodePath;

/// Outcome of a single znode call.
pub type CallResult<T> = std::result::Result<T, NativeCode>;

const LIVE: u8 = 0;
const EXPIRED: u8 = 1;
const CLOSED: u8 = 2;

/// One session with the ensemble.
struct Session {
    id: u64,
    connection: Arc<dyn Connection>,
    status: AtomicU8,
    operation_timeout: Duration,
    health: Arc<CallHealth>,
}

/// Shared, reference-counted access to a session.
///
/// Once the session expires or the manager shuts down, every call through the
/// handle fails; a handle is never rebound to a newer session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.session.id)
            .field("member", &self.member())
            .field("expired", &self.is_expired())
            .finish()
    }
}

impl SessionHandle {
    fn new(
        id: u64,
        connection: Arc<dyn Connection>,
        operation_timeout: Duration,
        health: Arc<CallHealth>,
    ) -> Self {
        Self {
            session: Arc::new(Session {
                id,
                connection,
                status: AtomicU8::new(LIVE),
                operation_timeout,
                health,
            }),
        }
    }

    /// Local id of the session, increasing with every new session.
    pub fn id(&self) -> u64 {
        self.session.id
    }

    /// Last-known ensemble member the session is attached to.
    pub fn member(&self) -> Option<String> {
        self.session.connection.member()
    }

    /// True once the session has expired.
    pub fn is_expired(&self) -> bool {
        self.session.status.load(Ordering::Acquire) == EXPIRED
    }

    fn mark(&self, status: u8) {
        // Closed wins over expired; neither is ever undone.
        let _ = self
            .session
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < status).then_some(status)
            });
    }

    fn check(&self) -> CallResult<()> {
        match self.session.status.load(Ordering::Acquire) {
            LIVE => Ok(()),
            EXPIRED => Err(NativeCode::SessionExpired),
            _ => Err(NativeCode::ClientClosed),
        }
    }

    async fn call<T, F>(&self, path: &ZnodePath, op: &'static str, fut: F) -> CallResult<T>
    where
        F: Future<Output = CallResult<T>>,
    {
        self.check()?;
        let started = Instant::now();
        let timeout = self.session.operation_timeout;
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(NativeCode::OperationTimeout {
                waited_ms: timeout.as_millis() as u64,
            }),
        };

        let result = match result {
            Err(NativeCode::SessionExpired) => {
                self.mark(EXPIRED);
                Err(NativeCode::SessionExpired)
            }
            // The session died underneath the call.
            Err(code @ (NativeCode::ConnectionLoss | NativeCode::OperationTimeout { .. })) => {
                Err(self.check().err().unwrap_or(code))
            }
            other => other,
        };

        match &result {
            Err(NativeCode::ConnectionLoss)
            | Err(NativeCode::OperationTimeout { .. })
            | Err(NativeCode::SessionExpired) => {
                self.session.health.record_failure();
            }
            _ => self.session.health.record_success(started.elapsed()),
        }
        if let Err(code) = &result {
            debug!(session = self.id(), op, path = %path, code = %code, "znode call failed");
        }
        result
    }

    /// Reads znode data and metadata.
    pub async fn get_data(&self, path: &ZnodePath) -> CallResult<(Vec<u8>, ZnodeStat)> {
        let conn = &self.session.connection;
        self.call(path, "get_data", conn.get_data(path.as_str())).await
    }

    /// Overwrites znode data.
    pub async fn set_data(&self, path: &ZnodePath, data: &[u8]) -> CallResult<ZnodeStat> {
        let conn = &self.session.connection;
        self.call(path, "set_data", conn.set_data(path.as_str(), data)).await
    }

    /// Creates a persistent znode.
    pub async fn create(&self, path: &ZnodePath, data: &[u8]) -> CallResult<()> {
        let conn = &self.session.connection;
        self.call(path, "create", conn.create(path.as_str(), data)).await
    }

    /// Deletes a childless znode.
    pub async fn delete(&self, path: &ZnodePath) -> CallResult<()> {
        let conn = &self.session.connection;
        self.call(path, "delete", conn.delete(path.as_str())).await
    }

    /// Returns znode metadata if it exists.
    pub async fn stat(&self, path: &ZnodePath) -> CallResult<Option<ZnodeStat>> {
        let conn = &self.session.connection;
        self.call(path, "stat", conn.stat(path.as_str())).await
    }

    /// Returns the names of direct children.
    pub async fn children(&self, path: &ZnodePath) -> CallResult<Vec<String>> {
        let conn = &self.session.connection;
        self.call(path, "children", conn.children(path.as_str())).await
    }
}

/// Published session state.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// No session yet, or a transient loss the client is recovering from.
    Disconnected,
    /// Opening a new session.
    Connecting {
        /// 1-based attempt number within the current reconnect cycle.
        attempt: u32,
    },
    /// Usable session.
    Connected(SessionHandle),
    /// The session expired; a new one is being opened.
    Expired {
        /// Id of the session that expired.
        session_id: u64,
    },
    /// Shut down.
    Closed,
    /// Bounded reconnection ran out of attempts.
    Failed {
        /// Attempts made.
        attempts: u32,
    },
}

/// Payload-free view of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// See [`SessionState::Disconnected`].
    Disconnected,
    /// See [`SessionState::Connecting`].
    Connecting,
    /// See [`SessionState::Connected`].
    Connected,
    /// See [`SessionState::Expired`].
    Expired,
    /// See [`SessionState::Closed`].
    Closed,
    /// See [`SessionState::Failed`].
    Failed,
}

impl SessionState {
    /// The state without its payload.
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Disconnected => SessionStatus::Disconnected,
            SessionState::Connecting { .. } => SessionStatus::Connecting,
            SessionState::Connected(_) => SessionStatus::Connected,
            SessionState::Expired { .. } => SessionStatus::Expired,
            SessionState::Closed => SessionStatus::Closed,
            SessionState::Failed { .. } => SessionStatus::Failed,
        }
    }

    /// States an `acquire()` stops waiting on. A connected handle that is
    /// already known to be expired is skipped until the supervisor replaces it.
    fn is_settled(&self) -> bool {
        match self {
            SessionState::Connected(handle) => !handle.is_expired(),
            SessionState::Closed | SessionState::Failed { .. } => true,
            _ => false,
        }
    }
}

/// Counters kept by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions opened.
    pub sessions_established: u64,
    /// Transient disconnects observed.
    pub disconnects: u64,
    /// Sessions lost to expiry.
    pub expirations: u64,
    /// Failed connection attempts.
    pub connect_failures: u64,
}

#[derive(Default)]
struct Counters {
    sessions_established: AtomicU64,
    disconnects: AtomicU64,
    expirations: AtomicU64,
    connect_failures: AtomicU64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: ConnectSettings,
    reconnect: ReconnectConfig,
    connection_timeout: Duration,
    operation_timeout: Duration,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    next_session_id: AtomicU64,
    counters: Counters,
    health: Arc<CallHealth>,
}

enum SessionEnd {
    Expired,
    Shutdown,
}

impl Inner {
    fn publish(&self, state: SessionState) {
        debug!(status = ?state.status(), "session state");
        self.state.send_replace(state);
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.reconnect.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.publish(SessionState::Connecting {
                attempt: backoff.attempts() + 1,
            });

            let attempt = tokio::time::timeout(
                self.connection_timeout,
                self.connector.connect(&self.settings),
            );
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = attempt => outcome,
            };

            let failure = match outcome {
                Ok(Ok(established)) => {
                    backoff.reset();
                    let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let handle = SessionHandle::new(
                        id,
                        established.connection,
                        self.operation_timeout,
                        Arc::clone(&self.health),
                    );
                    self.counters
                        .sessions_established
                        .fetch_add(1, Ordering::Relaxed);
                    info!(session = id, member = ?handle.member(), "session established");
                    self.publish(SessionState::Connected(handle.clone()));

                    match self.follow(&handle, established.events, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            handle.mark(CLOSED);
                            break;
                        }
                        SessionEnd::Expired => {
                            handle.mark(EXPIRED);
                            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                            warn!(session = id, "session expired, opening a new one");
                            self.publish(SessionState::Expired { session_id: id });
                            continue;
                        }
                    }
                }
                Ok(Err(code)) => code.to_string(),
                Err(_) => format!(
                    "no session within {}ms",
                    self.connection_timeout.as_millis()
                ),
            };

            backoff.record_failure();
            self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
            if backoff.exhausted() {
                error!(
                    attempts = backoff.attempts(),
                    reason = %failure,
                    "giving up connecting to the ensemble"
                );
                self.publish(SessionState::Failed {
                    attempts: backoff.attempts(),
                });
                return;
            }
            let delay = backoff.next_delay();
            warn!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                reason = %failure,
                "connect attempt failed"
            );
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.publish(SessionState::Closed);
        info!("session manager closed");
    }

    async fn follow(
        &self,
        handle: &SessionHandle,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                event = events.recv() => event,
            };
            match event {
                Some(SessionEvent::Disconnected) => {
                    self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = handle.id(),
                        "connection lost, waiting for the client to resume"
                    );
                    self.publish(SessionState::Disconnected);
                }
                Some(SessionEvent::Reconnected { read_only }) => {
                    info!(
                        session = handle.id(),
                        member = ?handle.member(),
                        read_only,
                        "session resumed"
                    );
                    self.publish(SessionState::Connected(handle.clone()));
                }
                Some(SessionEvent::Expired) => return SessionEnd::Expired,
                Some(SessionEvent::Closed) | None => {
                    warn!(session = handle.id(), "client closed underneath the session");
                    return SessionEnd::Expired;
                }
            }
        }
    }
}

/// Owns the single session shared by all operations.
///
/// Dropping the manager shuts the session down.
pub struct SessionManager {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("endpoints", &self.inner.settings.endpoints)
            .field("status", &self.status())
            .finish()
    }
}

impl SessionManager {
    /// Starts the supervisor task. Must be called from within a tokio runtime.
    pub fn start(connector: Arc<dyn Connector>, config: &StoreConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            connector,
            settings: config.connect_settings(),
            reconnect: config.reconnect.clone(),
            connection_timeout: config.connection_timeout(),
            operation_timeout: config.operation_timeout(),
            state,
            shutdown,
            next_session_id: AtomicU64::new(0),
            counters: Counters::default(),
            health: Arc::new(CallHealth::new()),
        });
        let supervisor = tokio::spawn(Arc::clone(&inner).supervise(shutdown_rx));
        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Waits for a connected session.
    ///
    /// Suspends while the session is connecting or recovering from a
    /// transient loss, up to the connection timeout.
    pub async fn acquire(&self) -> Result<SessionHandle> {
        let mut rx = self.inner.state.subscribe();
        let limit = self.inner.connection_timeout;
        let waited = tokio::time::timeout(limit, async {
            rx.wait_for(SessionState::is_settled)
                .await
                .map(|state| (*state).clone())
        })
        .await;

        match waited {
            Ok(Ok(SessionState::Connected(handle))) => Ok(handle),
            Ok(Ok(SessionState::Failed { attempts })) => {
                Err(StoreError::Connection(ConnectionError::GaveUp { attempts }))
            }
            Ok(_) => Err(StoreError::Connection(ConnectionError::Closed)),
            Err(_) => Err(StoreError::Connection(ConnectionError::Timeout {
                waited_ms: limit.as_millis() as u64,
            })),
        }
    }

    /// Waits for the session `previous` belongs to.
    ///
    /// Fails with `SessionExpired` when that session is gone, even if a newer
    /// one is available.
    pub async fn reacquire(&self, previous: &SessionHandle) -> Result<SessionHandle> {
        let expired = StoreError::SessionExpired {
            session_id: previous.id(),
        };
        if previous.is_expired() {
            return Err(expired);
        }
        let current = self.acquire().await?;
        if current.id() != previous.id() {
            return Err(expired);
        }
        Ok(current)
    }

    /// Current state without payload.
    pub fn status(&self) -> SessionStatus {
        self.inner.state.borrow().status()
    }

    /// Receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Waits until the published status equals `status`.
    pub async fn wait_for_status(&self, status: SessionStatus, limit: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(limit, async {
            rx.wait_for(|state| state.status() == status).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Supervisor counters.
    pub fn stats(&self) -> SessionStats {
        let c = &self.inner.counters;
        SessionStats {
            sessions_established: c.sessions_established.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            connect_failures: c.connect_failures.load(Ordering::Relaxed),
        }
    }

    /// Call health shared by all sessions of this manager.
    pub fn health(&self) -> &Arc<CallHealth> {
        &self.inner.health
    }

    /// Closes the session and waits for the supervisor to stop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let supervisor = self.supervisor.lock().take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                warn!("session supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}
