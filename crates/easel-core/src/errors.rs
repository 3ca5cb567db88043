use std::net::IpAddr;

use crate::ids::SessionId;

/// Typed error hierarchy for per-connection operations.
/// Classifies errors as precondition violations, resource exhaustion, or
/// protocol/IO failures. None of them ever reach beyond the one connection
/// that produced them.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    // Precondition violations
    #[error("flush called on an empty outbound queue")]
    EmptyQueue,
    #[error("no active session selected")]
    NoActiveSession,
    #[error("identical tool snapshot already cached for {0}")]
    ToolAlreadyCached(SessionId),
    #[error("not a member of {0}")]
    NotMember(SessionId),
    #[error("already a member of {0}")]
    AlreadyMember(SessionId),
    #[error("id 0 is reserved")]
    ReservedId,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    // Resource exhaustion
    #[error("output buffer allocation of {requested} bytes failed")]
    OutOfMemory { requested: usize },
    #[error("connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },
    #[error("session limit reached ({limit})")]
    SessionLimit { limit: usize },
    #[error("subscription limit reached ({limit})")]
    SubscriptionLimit { limit: usize },
    #[error("{0} already has a live connection")]
    DuplicatePeer(IpAddr),
    #[error("outbound queue full ({limit} messages)")]
    QueueFull { limit: usize },
    #[error("output buffer must drain {pending} bytes before the next frame")]
    OutputFull { pending: usize },

    // Protocol / IO
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("payload too large: {len} bytes")]
    PayloadTooLarge { len: usize },
    #[error("frame codec wrote {actual} bytes, declared {declared}")]
    FrameLengthMismatch { declared: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Errors after which the connection is closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::QueueFull { .. }
                | Self::FrameLengthMismatch { .. }
                | Self::Protocol(_)
                | Self::PayloadTooLarge { .. }
                | Self::Io(_)
        )
    }

    /// A caller broke an API precondition; the connection state is untouched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::EmptyQueue
                | Self::NoActiveSession
                | Self::ToolAlreadyCached(_)
                | Self::NotMember(_)
                | Self::AlreadyMember(_)
                | Self::ReservedId
                | Self::InvalidTransition { .. }
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::EmptyQueue => "empty_queue",
            Self::NoActiveSession => "no_active_session",
            Self::ToolAlreadyCached(_) => "tool_already_cached",
            Self::NotMember(_) => "not_member",
            Self::AlreadyMember(_) => "already_member",
            Self::ReservedId => "reserved_id",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::ConnectionLimit { .. } => "connection_limit",
            Self::SessionLimit { .. } => "session_limit",
            Self::SubscriptionLimit { .. } => "subscription_limit",
            Self::DuplicatePeer(_) => "duplicate_peer",
            Self::QueueFull { .. } => "queue_full",
            Self::OutputFull { .. } => "output_full",
            Self::Protocol(_) => "protocol",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::FrameLengthMismatch { .. } => "frame_length_mismatch",
            Self::Io(_) => "io",
        }
    }
}
