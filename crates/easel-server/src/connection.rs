use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use easel_core::{
    Capabilities, ConnectionError, ConnectionId, Extensions, SessionId, SharedMessage,
};
use serde::Serialize;
use tokio::time::Instant;

use crate::membership::Membership;
use crate::output::OutputBuffer;
use crate::session::Session;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Accepted, handshake not yet seen.
    Connected,
    /// Handshake accepted, no session joined.
    Verified,
    /// Joined at least one session.
    Active,
    /// Being torn down.
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Verified => "verified",
            Self::Active => "active",
            Self::Closing => "closing",
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connected, Self::Verified)
                | (Self::Verified, Self::Active)
                | (Self::Connected | Self::Verified | Self::Active, Self::Closing)
        )
    }
}

/// Which protocol layer the connection is currently addressing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolLayer {
    /// Before the handshake.
    #[default]
    Handshake,
    /// Server-level requests.
    Global,
    /// Messages for the active session.
    Session,
}

/// Whose state is being replayed to this connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "session")]
pub enum SyncTarget {
    #[default]
    Global,
    Session(SessionId),
}

/// What a connection is allowed to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AccessLevel {
    pub draw: bool,
    pub chat: bool,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self {
            draw: true,
            chat: true,
        }
    }
}

/// Outbound queue bound when none is configured.
pub const DEFAULT_QUEUE_LIMIT: usize = 4096;

/// Server-side state of one client connection.
///
/// Every mutation happens under the registry's per-connection lock; the
/// socket itself lives in the driver tasks.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
    layer: ProtocolLayer,
    sync: SyncTarget,
    capabilities: Capabilities,
    extensions: Extensions,
    is_admin: bool,
    access: AccessLevel,
    last_activity: Instant,
    queue: VecDeque<SharedMessage>,
    queue_limit: usize,
    inbound: Option<BytesMut>,
    output: OutputBuffer,
    membership: Membership,
}

impl Connection {
    pub fn new(raw_id: u8, peer: SocketAddr, output: OutputBuffer) -> Result<Self, ConnectionError> {
        let id = ConnectionId::try_from(raw_id)?;
        Ok(Self {
            id,
            peer,
            state: ConnectionState::Connected,
            layer: ProtocolLayer::Handshake,
            sync: SyncTarget::Global,
            capabilities: Capabilities::default(),
            extensions: Extensions::default(),
            is_admin: false,
            access: AccessLevel::default(),
            last_activity: Instant::now(),
            queue: VecDeque::new(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            inbound: None,
            output,
            membership: Membership::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), ConnectionError> {
        if !self.state.can_transition_to(next) {
            return Err(ConnectionError::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        tracing::debug!(
            conn_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Connection state change"
        );
        self.state = next;
        if next == ConnectionState::Verified {
            self.layer = ProtocolLayer::Global;
        }
        Ok(())
    }

    pub fn layer(&self) -> ProtocolLayer {
        self.layer
    }

    pub fn sync_target(&self) -> SyncTarget {
        self.sync
    }

    pub fn begin_sync(&mut self, session_id: SessionId) {
        self.sync = SyncTarget::Session(session_id);
    }

    pub fn end_sync(&mut self) {
        self.sync = SyncTarget::Global;
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn extensions(&self) -> Extensions {
        self.extensions
    }

    pub fn set_extensions(&mut self, extensions: Extensions) {
        self.extensions = extensions;
    }

    /// Apply the handshake flag bytes. Extensions are limited to what the
    /// server supports.
    pub fn negotiate(&mut self, caps: u8, ext: u8, supported: Extensions) {
        self.capabilities = Capabilities::decode(caps);
        self.extensions = Extensions::decode(ext).intersect(supported);
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn set_admin(&mut self, is_admin: bool) {
        self.is_admin = is_admin;
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn set_access(&mut self, access: AccessLevel) {
        self.access = access;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Append to the outbound queue. Kinds the negotiated extensions do not
    /// cover are dropped with `Ok(false)`. A full queue means the client is
    /// not reading; the message is refused with [`ConnectionError::QueueFull`].
    pub fn enqueue(&mut self, message: SharedMessage) -> Result<bool, ConnectionError> {
        if !self.extensions.permits(message.kind) {
            tracing::trace!(
                conn_id = %self.id,
                kind = message.kind.as_str(),
                "Dropping message outside negotiated extensions"
            );
            return Ok(false);
        }
        if self.queue.len() >= self.queue_limit {
            return Err(ConnectionError::QueueFull {
                limit: self.queue_limit,
            });
        }
        self.queue.push_back(message);
        Ok(true)
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    pub fn set_queue_limit(&mut self, limit: usize) {
        self.queue_limit = limit.max(1);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued(&self) -> impl Iterator<Item = &SharedMessage> {
        self.queue.iter()
    }

    /// Inbound assembly buffer, allocated on first use.
    pub fn inbound_buffer(&mut self) -> &mut BytesMut {
        self.inbound.get_or_insert_with(BytesMut::new)
    }

    pub fn release_inbound(&mut self) {
        self.inbound = None;
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut OutputBuffer {
        &mut self.output
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn membership_mut(&mut self) -> &mut Membership {
        &mut self.membership
    }

    /// Select the active session and switch to the session layer.
    pub fn select_active(&mut self, session_id: SessionId) -> Result<Arc<Session>, ConnectionError> {
        let session = self.membership.select_active(session_id)?;
        self.layer = ProtocolLayer::Session;
        Ok(session)
    }

    pub(crate) fn outbound_parts(&mut self) -> (&mut VecDeque<SharedMessage>, &mut OutputBuffer) {
        (&mut self.queue, &mut self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::{Message, MessageKind};

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn connection(raw: u8) -> Connection {
        Connection::new(raw, addr(), OutputBuffer::with_capacity(64, 1024).unwrap()).unwrap()
    }

    fn msg(kind: MessageKind) -> SharedMessage {
        Message::new(kind, ConnectionId::new(2), SessionId::new(1), vec![1u8])
            .unwrap()
            .shared()
    }

    #[test]
    fn sentinel_id_rejected() {
        let err = Connection::new(0, addr(), OutputBuffer::with_capacity(8, 8).unwrap()).unwrap_err();
        assert!(matches!(err, ConnectionError::ReservedId));
    }

    #[test]
    fn new_connection_defaults() {
        let conn = connection(3);
        assert_eq!(conn.id().get(), 3);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.layer(), ProtocolLayer::Handshake);
        assert_eq!(conn.sync_target(), SyncTarget::Global);
        assert_eq!(conn.capabilities(), Capabilities::default());
        assert_eq!(conn.extensions(), Extensions::default());
        assert!(!conn.is_admin());
        assert!(!conn.has_inbound());
        assert_eq!(conn.queue_len(), 0);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut conn = connection(1);
        conn.transition(ConnectionState::Verified).unwrap();
        assert_eq!(conn.layer(), ProtocolLayer::Global);
        conn.transition(ConnectionState::Active).unwrap();
        conn.transition(ConnectionState::Closing).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut conn = connection(1);
        let err = conn.transition(ConnectionState::Active).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::InvalidTransition {
                from: "connected",
                to: "active"
            }
        ));
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.transition(ConnectionState::Closing).unwrap();
        assert!(conn.transition(ConnectionState::Closing).is_err());
        assert!(conn.transition(ConnectionState::Verified).is_err());
    }

    #[test]
    fn negotiate_intersects_with_server_support() {
        let mut conn = connection(1);
        let supported = Extensions {
            deflate: false,
            chat: true,
            palette: true,
        };
        conn.negotiate(0xFF, 0xFF, supported);
        assert!(conn.capabilities().ack_feedback);
        assert_eq!(conn.extensions(), supported);
    }

    #[test]
    fn enqueue_respects_extensions() {
        let mut conn = connection(1);
        conn.negotiate(0, easel_core::flags::bits::PALETTE, Extensions::ALL);

        assert!(conn.enqueue(msg(MessageKind::StrokeInfo)).unwrap());
        assert!(!conn.enqueue(msg(MessageKind::Chat)).unwrap());
        assert!(conn.enqueue(msg(MessageKind::Palette)).unwrap());
        let kinds: Vec<_> = conn.queued().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::StrokeInfo, MessageKind::Palette]);
    }

    #[test]
    fn enqueue_stops_at_queue_limit() {
        let mut conn = connection(1);
        assert_eq!(conn.queue_limit(), DEFAULT_QUEUE_LIMIT);
        conn.set_queue_limit(8);
        for _ in 0..8 {
            assert!(conn.enqueue(msg(MessageKind::StrokeInfo)).unwrap());
        }

        let err = conn.enqueue(msg(MessageKind::StrokeInfo)).unwrap_err();
        assert!(matches!(err, ConnectionError::QueueFull { limit: 8 }));
        assert!(err.is_fatal());
        assert_eq!(conn.queue_len(), 8);
    }

    #[test]
    fn inbound_buffer_lazily_allocated() {
        let mut conn = connection(1);
        conn.inbound_buffer().extend_from_slice(b"abc");
        assert!(conn.has_inbound());
        conn.release_inbound();
        assert!(!conn.has_inbound());
    }

    #[test]
    fn select_active_switches_layer() {
        let mut conn = connection(1);
        let sid = SessionId::new(4).unwrap();
        assert!(conn.select_active(sid).is_err());
        assert_eq!(conn.layer(), ProtocolLayer::Handshake);

        conn.membership_mut()
            .join(sid, Arc::new(Session::new(sid, None)))
            .unwrap();
        conn.select_active(sid).unwrap();
        assert_eq!(conn.layer(), ProtocolLayer::Session);
    }

    #[test]
    fn sync_target_toggles() {
        let mut conn = connection(1);
        let sid = SessionId::new(2).unwrap();
        conn.begin_sync(sid);
        assert_eq!(conn.sync_target(), SyncTarget::Session(sid));
        conn.end_sync();
        assert_eq!(conn.sync_target(), SyncTarget::Global);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let mut conn = connection(1);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(conn.idle_for(Instant::now()), Duration::from_secs(30));
        conn.touch();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }
}
