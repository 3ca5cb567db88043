use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use easel_core::{ConnectionError, ConnectionId, SessionId, SharedMessage};
use easel_settings::EaselSettings;
use easel_telemetry::metrics::{names, MetricsRecorder};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::connection::{Connection, ConnectionState};
use crate::output::OutputBuffer;
use crate::session::Session;

/// Registry limits.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub user_limit: usize,
    pub allow_duplicate_peers: bool,
    pub output_buffer_bytes: usize,
    pub max_output_buffer_bytes: usize,
    pub max_queued_messages: usize,
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&EaselSettings::default())
    }
}

impl From<&EaselSettings> for RegistryConfig {
    fn from(settings: &EaselSettings) -> Self {
        Self {
            user_limit: settings.limits.user_limit,
            allow_duplicate_peers: settings.permissions.allow_duplicate_connections,
            output_buffer_bytes: settings.limits.output_buffer_bytes,
            max_output_buffer_bytes: settings.limits.max_output_buffer_bytes,
            max_queued_messages: settings.limits.max_queued_messages,
            idle_timeout: Duration::from_secs(settings.limits.idle_timeout_secs),
        }
    }
}

/// A registered connection: its state behind a lock, plus the signals the
/// driver tasks wait on.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    connection: Mutex<Connection>,
    writable: Notify,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock()
    }

    /// Wake the writer task.
    pub fn notify_writable(&self) {
        self.writable.notify_one();
    }

    pub fn writable(&self) -> Notified<'_> {
        self.writable.notified()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// Connections that received messages and still need waking.
#[derive(Debug, Default)]
pub struct Wakeups(BTreeSet<ConnectionId>);

impl Wakeups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: ConnectionId) {
        self.0.insert(id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-connection summary for the stats endpoint.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub state: ConnectionState,
    pub sessions: Vec<SessionId>,
    pub active_session: Option<SessionId>,
    pub queued: usize,
    pub pending_bytes: usize,
    pub idle_secs: u64,
}

/// Registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    alloc_lock: Mutex<()>,
    config: RegistryConfig,
    metrics: Arc<MetricsRecorder>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            connections: DashMap::new(),
            alloc_lock: Mutex::new(()),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocate an id and register a connection for `peer`.
    pub fn register(&self, peer: SocketAddr) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let _guard = self.alloc_lock.lock();

        if let Err(err) = self.check_admission(peer) {
            self.metrics
                .counter_inc(names::CONNECTIONS_REJECTED, &[("reason", err.error_kind())], 1);
            return Err(err);
        }

        let id = (1..=u8::MAX)
            .filter_map(ConnectionId::new)
            .find(|id| !self.connections.contains_key(id))
            .ok_or(ConnectionError::ConnectionLimit {
                limit: self.config.user_limit,
            })?;

        let output = OutputBuffer::with_capacity(
            self.config.output_buffer_bytes,
            self.config.max_output_buffer_bytes,
        )?;
        let mut connection = Connection::new(id.get(), peer, output)?;
        connection.set_queue_limit(self.config.max_queued_messages);
        let handle = Arc::new(ConnectionHandle {
            id,
            peer,
            connection: Mutex::new(connection),
            writable: Notify::new(),
            closed: CancellationToken::new(),
        });
        self.connections.insert(id, Arc::clone(&handle));

        self.metrics.counter_inc(names::CONNECTIONS_TOTAL, &[], 1);
        self.metrics
            .gauge_set(names::CONNECTIONS_ACTIVE, &[], self.connections.len() as f64);
        tracing::info!(conn_id = %id, peer = %peer, "Connection registered");
        Ok(handle)
    }

    fn check_admission(&self, peer: SocketAddr) -> Result<(), ConnectionError> {
        if self.connections.len() >= self.config.user_limit {
            return Err(ConnectionError::ConnectionLimit {
                limit: self.config.user_limit,
            });
        }
        if !self.config.allow_duplicate_peers
            && self.handles().iter().any(|h| h.peer.ip() == peer.ip())
        {
            return Err(ConnectionError::DuplicatePeer(peer.ip()));
        }
        Ok(())
    }

    /// Remove a connection and signal its tasks to stop.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(&id)?;
        handle.close();
        self.metrics
            .gauge_set(names::CONNECTIONS_ACTIVE, &[], self.connections.len() as f64);
        tracing::info!(conn_id = %id, "Connection unregistered");
        Some(handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Clone out every handle so no map guard is held while locking.
    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Queue a message and wake the connection's writer.
    pub fn enqueue(&self, id: ConnectionId, message: SharedMessage) -> bool {
        let mut wakeups = Wakeups::new();
        let queued = self.enqueue_into(id, message, &mut wakeups);
        self.wake(wakeups);
        queued
    }

    /// Queue a message; the writer is woken later through `wakeups`.
    pub fn enqueue_into(
        &self,
        id: ConnectionId,
        message: SharedMessage,
        wakeups: &mut Wakeups,
    ) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        if handle.is_closed() {
            return false;
        }
        let result = handle.lock().enqueue(message);
        match result {
            Ok(true) => {
                wakeups.add(id);
                true
            }
            Ok(false) => false,
            Err(err) => {
                // The client stopped reading; drop it rather than buffer
                // without bound.
                self.metrics
                    .counter_inc(names::ERRORS, &[("kind", err.error_kind())], 1);
                tracing::warn!(conn_id = %id, error = %err, "Closing slow connection");
                handle.close();
                false
            }
        }
    }

    /// Fan `message` out to every member of `session`, sharing one record.
    pub fn broadcast(
        &self,
        session: &Session,
        message: SharedMessage,
        except: Option<ConnectionId>,
    ) -> usize {
        let mut wakeups = Wakeups::new();
        let delivered = self.broadcast_into(session, message, except, &mut wakeups);
        self.wake(wakeups);
        delivered
    }

    pub fn broadcast_into(
        &self,
        session: &Session,
        message: SharedMessage,
        except: Option<ConnectionId>,
        wakeups: &mut Wakeups,
    ) -> usize {
        session
            .members()
            .into_iter()
            .filter(|member| Some(*member) != except)
            .filter(|member| self.enqueue_into(*member, Arc::clone(&message), wakeups))
            .count()
    }

    pub fn wake(&self, wakeups: Wakeups) {
        for id in wakeups.0 {
            if let Some(handle) = self.get(id) {
                handle.notify_writable();
            }
        }
    }

    /// Connections idle for longer than the configured timeout.
    pub fn idle_connections(&self, now: Instant) -> Vec<ConnectionId> {
        self.handles()
            .into_iter()
            .filter(|handle| handle.lock().idle_for(now) > self.config.idle_timeout)
            .map(|handle| handle.id)
            .collect()
    }

    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut infos: Vec<_> = self
            .handles()
            .into_iter()
            .map(|handle| {
                let conn = handle.lock();
                ConnectionInfo {
                    id: handle.id,
                    peer: handle.peer.to_string(),
                    state: conn.state(),
                    sessions: conn.membership().session_ids(),
                    active_session: conn.membership().active_id(),
                    queued: conn.queue_len(),
                    pending_bytes: conn.output().len(),
                    idle_secs: conn.idle_for(now).as_secs(),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
