use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::errors::ConnectionError;
use crate::ids::{ConnectionId, SessionId};

/// Message type tag, carried as the first byte of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Identifier,
    StrokeInfo,
    StrokeEnd,
    ToolInfo,
    Chat,
    Palette,
    SessionSelect,
    Subscribe,
    Unsubscribe,
    Ack,
    Error,
    Other(u8),
}

impl MessageKind {
    /// Short name for logging/metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::StrokeInfo => "stroke_info",
            Self::StrokeEnd => "stroke_end",
            Self::ToolInfo => "tool_info",
            Self::Chat => "chat",
            Self::Palette => "palette",
            Self::SessionSelect => "session_select",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Other(_) => "other",
        }
    }
}

impl From<u8> for MessageKind {
    fn from(raw: u8) -> Self {
        match raw {
            1 => Self::Identifier,
            2 => Self::StrokeInfo,
            3 => Self::StrokeEnd,
            4 => Self::ToolInfo,
            5 => Self::Chat,
            6 => Self::Palette,
            7 => Self::SessionSelect,
            8 => Self::Subscribe,
            9 => Self::Unsubscribe,
            10 => Self::Ack,
            11 => Self::Error,
            other => Self::Other(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Identifier => 1,
            MessageKind::StrokeInfo => 2,
            MessageKind::StrokeEnd => 3,
            MessageKind::ToolInfo => 4,
            MessageKind::Chat => 5,
            MessageKind::Palette => 6,
            MessageKind::SessionSelect => 7,
            MessageKind::Subscribe => 8,
            MessageKind::Unsubscribe => 9,
            MessageKind::Ack => 10,
            MessageKind::Error => 11,
            MessageKind::Other(raw) => raw,
        }
    }
}

/// Immutable message record. Broadcast fans the same `Arc` out to many
/// connection queues, so nothing here is ever mutated after creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub origin: Option<ConnectionId>,
    pub session: Option<SessionId>,
    pub payload: Bytes,
}

/// Shared handle to a queued message.
pub type SharedMessage = Arc<Message>;

impl Message {
    /// Largest payload one frame entry can describe (u16 length prefix).
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    pub fn new(
        kind: MessageKind,
        origin: Option<ConnectionId>,
        session: Option<SessionId>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ConnectionError> {
        let payload = payload.into();
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(ConnectionError::PayloadTooLarge { len: payload.len() });
        }
        Ok(Self {
            kind,
            origin,
            session,
            payload,
        })
    }

    /// Server acknowledgement of a message of `acked` kind.
    pub fn ack(acked: MessageKind, session: Option<SessionId>) -> Self {
        Self {
            kind: MessageKind::Ack,
            origin: None,
            session,
            payload: Bytes::copy_from_slice(&[u8::from(acked)]),
        }
    }

    /// Server error reply carrying a short reason string.
    pub fn error(session: Option<SessionId>, reason: &str) -> Self {
        let reason = &reason.as_bytes()[..reason.len().min(Self::MAX_PAYLOAD)];
        Self {
            kind: MessageKind::Error,
            origin: None,
            session,
            payload: Bytes::copy_from_slice(reason),
        }
    }

    /// Whether `other` may share a batched frame with this message.
    pub fn same_batch(&self, other: &Message) -> bool {
        self.kind == other.kind && self.origin == other.origin && self.session == other.session
    }

    pub fn shared(self) -> SharedMessage {
        Arc::new(self)
    }
}

/// Drawing-tool parameters. Cached per session membership so unchanged
/// tool state is not re-sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub tool_id: u8,
    pub mode: u8,
    pub lo_color: [u8; 4],
    pub hi_color: [u8; 4],
    pub lo_size: u8,
    pub hi_size: u8,
    pub lo_hardness: u8,
    pub hi_hardness: u8,
    pub spacing: u8,
}

impl ToolInfo {
    pub const ENCODED_LEN: usize = 15;

    pub fn decode(payload: &[u8]) -> Result<Self, ConnectionError> {
        if payload.len() != Self::ENCODED_LEN {
            return Err(ConnectionError::Protocol(format!(
                "tool info payload is {} bytes, expected {}",
                payload.len(),
                Self::ENCODED_LEN
            )));
        }
        let color = |at: usize| [payload[at], payload[at + 1], payload[at + 2], payload[at + 3]];
        Ok(Self {
            tool_id: payload[0],
            mode: payload[1],
            lo_color: color(2),
            hi_color: color(6),
            lo_size: payload[10],
            hi_size: payload[11],
            lo_hardness: payload[12],
            hi_hardness: payload[13],
            spacing: payload[14],
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u8(self.tool_id);
        buf.put_u8(self.mode);
        buf.put_slice(&self.lo_color);
        buf.put_slice(&self.hi_color);
        buf.put_u8(self.lo_size);
        buf.put_u8(self.hi_size);
        buf.put_u8(self.lo_hardness);
        buf.put_u8(self.hi_hardness);
        buf.put_u8(self.spacing);
        buf.freeze()
    }
}
