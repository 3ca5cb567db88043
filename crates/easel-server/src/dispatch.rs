//! Applies inbound messages to connection and session state.
//!
//! Lock order: a connection's lock is never held while another
//! connection's lock is taken. Work that needs several connections
//! collects what it needs under one lock, releases it, then moves on.

use std::net::SocketAddr;
use std::sync::Arc;

use easel_core::{
    ConnectionError, ConnectionId, CountedFrameCodec, Extensions, Frame, FrameCodec, Message,
    MessageKind, SessionId, ToolInfo,
};
use easel_settings::EaselSettings;
use easel_telemetry::metrics::{names, MetricsRecorder};
use tokio::time::Instant;

use crate::connection::{AccessLevel, ConnectionState};
use crate::registry::{ConnectionHandle, ConnectionRegistry, RegistryConfig, Wakeups};
use crate::session::{Session, SessionRegistry};

/// Dispatch policy taken from settings.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub subscription_limit: usize,
    pub supported_extensions: Extensions,
    pub access: AccessLevel,
}

impl From<&EaselSettings> for DispatchConfig {
    fn from(settings: &EaselSettings) -> Self {
        let ext = &settings.server.extensions;
        Self {
            subscription_limit: settings.limits.subscription_limit,
            supported_extensions: Extensions {
                deflate: ext.deflate,
                chat: ext.chat,
                palette: ext.palette,
            },
            access: AccessLevel {
                draw: settings.permissions.allow_draw,
                chat: settings.permissions.allow_chat,
            },
        }
    }
}

/// Shared server state: every connection, every session, and the rules
/// for moving messages between them.
pub struct Hub {
    connections: ConnectionRegistry,
    sessions: SessionRegistry,
    config: DispatchConfig,
    codec: Arc<dyn FrameCodec>,
    metrics: Arc<MetricsRecorder>,
}

impl Hub {
    pub fn new(settings: &EaselSettings, metrics: Arc<MetricsRecorder>) -> Self {
        Self::with_codec(settings, metrics, Arc::new(CountedFrameCodec))
    }

    pub fn with_codec(
        settings: &EaselSettings,
        metrics: Arc<MetricsRecorder>,
        codec: Arc<dyn FrameCodec>,
    ) -> Self {
        Self {
            connections: ConnectionRegistry::new(
                RegistryConfig::from(settings),
                Arc::clone(&metrics),
            ),
            sessions: SessionRegistry::new(settings.limits.session_limit),
            config: DispatchConfig::from(settings),
            codec,
            metrics,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn codec(&self) -> &dyn FrameCodec {
        self.codec.as_ref()
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Admit a new connection.
    pub fn connect(&self, peer: SocketAddr) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let handle = self.connections.register(peer)?;
        handle.lock().set_access(self.config.access);
        Ok(handle)
    }

    /// Tear a connection down and drop it from every session it joined.
    pub fn disconnect(&self, id: ConnectionId) {
        let Some(handle) = self.connections.unregister(id) else {
            return;
        };
        let joined = {
            let mut conn = handle.lock();
            if conn.state() != ConnectionState::Closing {
                let _ = conn.transition(ConnectionState::Closing);
            }
            conn.release_inbound();
            conn.membership_mut().drain()
        };
        for session in joined {
            self.sessions.leave(session.id(), id);
        }
        self.record_sessions();
    }

    /// Disconnect every connection idle past the configured timeout.
    pub fn disconnect_idle(&self, now: Instant) -> usize {
        let idle = self.connections.idle_connections(now);
        for id in &idle {
            tracing::info!(conn_id = %id, "Disconnecting idle connection");
            self.disconnect(*id);
        }
        idle.len()
    }

    /// Apply every message of an inbound frame, then wake the connections
    /// that received something. Returns only fatal errors.
    pub fn handle_frame(&self, from: ConnectionId, frame: Frame) -> Result<(), ConnectionError> {
        let mut wakeups = Wakeups::new();
        let result = frame
            .into_messages(Some(from))
            .into_iter()
            .try_for_each(|message| self.handle_message(from, message, &mut wakeups));
        self.connections.wake(wakeups);
        result
    }

    fn handle_message(
        &self,
        from: ConnectionId,
        message: Message,
        wakeups: &mut Wakeups,
    ) -> Result<(), ConnectionError> {
        let kind = message.kind;
        self.metrics
            .counter_inc(names::MESSAGES_RECEIVED, &[("kind", kind.as_str())], 1);

        let session = message.session;
        match self.apply(from, message, wakeups) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.metrics
                    .counter_inc(names::ERRORS, &[("kind", err.error_kind())], 1);
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::debug!(
                    conn_id = %from,
                    kind = kind.as_str(),
                    error = %err,
                    "Rejected message"
                );
                let reply = Message::error(session, &err.to_string());
                self.connections.enqueue_into(from, reply.shared(), wakeups);
                Ok(())
            }
        }
    }

    fn apply(
        &self,
        from: ConnectionId,
        message: Message,
        wakeups: &mut Wakeups,
    ) -> Result<(), ConnectionError> {
        let Some(handle) = self.connections.get(from) else {
            return Ok(());
        };
        let state = {
            let mut conn = handle.lock();
            conn.touch();
            conn.state()
        };

        match state {
            ConnectionState::Closing => return Ok(()),
            ConnectionState::Connected if message.kind != MessageKind::Identifier => {
                return Err(ConnectionError::Protocol(format!(
                    "expected identifier, got {}",
                    message.kind.as_str()
                )));
            }
            _ => {}
        }

        match message.kind {
            MessageKind::Identifier => self.identify(&handle, &message, wakeups),
            MessageKind::Subscribe => self.subscribe(&handle, require_session(&message)?, wakeups),
            MessageKind::Unsubscribe => self.unsubscribe(&handle, require_session(&message)?),
            MessageKind::SessionSelect => {
                handle.lock().select_active(require_session(&message)?)?;
                Ok(())
            }
            MessageKind::ToolInfo => self.tool_info(&handle, message, wakeups),
            MessageKind::StrokeInfo | MessageKind::StrokeEnd => {
                if !handle.lock().access().draw {
                    self.drop_message(from, &message, "draw_not_allowed");
                    return Ok(());
                }
                self.relay(&handle, message, wakeups)
            }
            MessageKind::Chat => {
                if !handle.lock().access().chat {
                    self.drop_message(from, &message, "chat_not_allowed");
                    return Ok(());
                }
                self.relay(&handle, message, wakeups)
            }
            MessageKind::Palette => self.relay(&handle, message, wakeups),
            MessageKind::Ack | MessageKind::Error | MessageKind::Other(_) => {
                self.drop_message(from, &message, "unexpected_kind");
                Ok(())
            }
        }
    }

    fn identify(
        &self,
        handle: &ConnectionHandle,
        message: &Message,
        wakeups: &mut Wakeups,
    ) -> Result<(), ConnectionError> {
        let (Some(&caps), Some(&ext)) = (message.payload.first(), message.payload.get(1)) else {
            return Err(ConnectionError::Protocol(format!(
                "identifier payload is {} bytes, expected 2",
                message.payload.len()
            )));
        };

        let reply = {
            let mut conn = handle.lock();
            conn.transition(ConnectionState::Verified)?;
            conn.negotiate(caps, ext, self.config.supported_extensions);
            tracing::info!(
                conn_id = %conn.id(),
                ack_feedback = conn.capabilities().ack_feedback,
                extensions = conn.extensions().encode(),
                "Handshake complete"
            );
            Message::new(
                MessageKind::Identifier,
                None,
                None,
                vec![
                    conn.id().get(),
                    conn.capabilities().encode(),
                    conn.extensions().encode(),
                ],
            )?
        };
        self.connections
            .enqueue_into(handle.id(), reply.shared(), wakeups);
        Ok(())
    }

    fn subscribe(
        &self,
        handle: &ConnectionHandle,
        session_id: SessionId,
        wakeups: &mut Wakeups,
    ) -> Result<(), ConnectionError> {
        let from = handle.id();
        {
            let conn = handle.lock();
            if conn.membership().is_member(session_id) {
                return Err(ConnectionError::AlreadyMember(session_id));
            }
            if conn.membership().len() >= self.config.subscription_limit {
                return Err(ConnectionError::SubscriptionLimit {
                    limit: self.config.subscription_limit,
                });
            }
        }

        let session = self.sessions.join(session_id, from)?;
        {
            let mut conn = handle.lock();
            // A disconnect may have drained the membership since the check
            // above; joining now would leave a member nobody removes.
            if conn.state() == ConnectionState::Closing || handle.is_closed() {
                drop(conn);
                self.sessions.leave(session_id, from);
                return Ok(());
            }
            if let Err(err) = conn.membership_mut().join(session_id, Arc::clone(&session)) {
                drop(conn);
                self.sessions.leave(session_id, from);
                return Err(err);
            }
            if conn.state() == ConnectionState::Verified {
                conn.transition(ConnectionState::Active)?;
            }
            if conn.membership().active_id().is_none() {
                conn.select_active(session_id)?;
            }
            conn.begin_sync(session_id);
        }
        tracing::info!(conn_id = %from, session_id = %session_id, "Joined session");
        self.record_sessions();

        let replay = self.tool_snapshots(&session, from);
        let mut conn = handle.lock();
        for message in replay {
            conn.enqueue(message.shared())?;
        }
        conn.end_sync();
        wakeups.add(from);
        Ok(())
    }

    /// Cached tools of every other member, to bring a new member up to date.
    fn tool_snapshots(&self, session: &Session, except: ConnectionId) -> Vec<Message> {
        let session_id = session.id();
        session
            .members()
            .into_iter()
            .filter(|member| *member != except)
            .filter_map(|member| self.connections.get(member))
            .filter_map(|other| {
                let tool = *other.lock().membership().cached_tool(session_id)?;
                Some(tool_message(other.id(), session_id, &tool))
            })
            .collect()
    }

    fn unsubscribe(
        &self,
        handle: &ConnectionHandle,
        session_id: SessionId,
    ) -> Result<(), ConnectionError> {
        handle.lock().membership_mut().leave(session_id)?;
        self.sessions.leave(session_id, handle.id());
        tracing::info!(conn_id = %handle.id(), session_id = %session_id, "Left session");
        self.record_sessions();
        Ok(())
    }

    fn tool_info(
        &self,
        handle: &ConnectionHandle,
        message: Message,
        wakeups: &mut Wakeups,
    ) -> Result<(), ConnectionError> {
        let tool = ToolInfo::decode(&message.payload)?;
        let session = {
            let mut conn = handle.lock();
            let session_id = match conn.membership_mut().cache_tool(&tool) {
                Ok(session_id) => session_id,
                Err(ConnectionError::ToolAlreadyCached(_)) => {
                    drop(conn);
                    self.drop_message(handle.id(), &message, "tool_unchanged");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            conn.membership()
                .lookup(session_id)
                .map(|data| Arc::clone(&data.session))
                .ok_or(ConnectionError::NotMember(session_id))?
        };

        let relayed = tool_message(handle.id(), session.id(), &tool);
        self.connections
            .broadcast_into(&session, relayed.shared(), Some(handle.id()), wakeups);
        Ok(())
    }

    /// Forward a session message to the other members. Messages without a
    /// session target the active session.
    fn relay(
        &self,
        handle: &ConnectionHandle,
        message: Message,
        wakeups: &mut Wakeups,
    ) -> Result<(), ConnectionError> {
        let from = handle.id();
        let (session, ack) = {
            let conn = handle.lock();
            let session_id = message
                .session
                .or(conn.membership().active_id())
                .ok_or(ConnectionError::NoActiveSession)?;
            let session = conn
                .membership()
                .lookup(session_id)
                .map(|data| Arc::clone(&data.session))
                .ok_or(ConnectionError::NotMember(session_id))?;
            let ack = message.kind == MessageKind::StrokeEnd && conn.capabilities().ack_feedback;
            (session, ack)
        };

        let kind = message.kind;
        let relayed = Message {
            origin: Some(from),
            session: Some(session.id()),
            ..message
        };
        self.connections
            .broadcast_into(&session, relayed.shared(), Some(from), wakeups);

        if ack {
            let ack = Message::ack(kind, Some(session.id()));
            self.connections.enqueue_into(from, ack.shared(), wakeups);
        }
        Ok(())
    }

    fn drop_message(&self, from: ConnectionId, message: &Message, reason: &'static str) {
        tracing::trace!(
            conn_id = %from,
            kind = message.kind.as_str(),
            reason,
            "Dropped inbound message"
        );
        self.metrics
            .counter_inc(names::MESSAGES_DROPPED, &[("reason", reason)], 1);
    }

    fn record_sessions(&self) {
        self.metrics
            .gauge_set(names::SESSIONS_ACTIVE, &[], self.sessions.count() as f64);
    }
}

fn require_session(message: &Message) -> Result<SessionId, ConnectionError> {
    message.session.ok_or_else(|| {
        ConnectionError::Protocol(format!("{} without a session id", message.kind.as_str()))
    })
}

fn tool_message(origin: ConnectionId, session: SessionId, tool: &ToolInfo) -> Message {
    Message {
        kind: MessageKind::ToolInfo,
        origin: Some(origin),
        session: Some(session),
        payload: tool.encode(),
    }
}
