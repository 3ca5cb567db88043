//! Protocol-level types shared by every easel crate: single-byte ids,
//! negotiated feature flags, the message model, the batched frame codec and
//! the connection error taxonomy.

pub mod codec;
pub mod errors;
pub mod flags;
pub mod ids;
pub mod message;

pub use codec::{CountedFrameCodec, Frame, FrameCodec, Run, MAX_RUN};
pub use errors::ConnectionError;
pub use flags::{Capabilities, Extensions};
pub use ids::{ConnectionId, SessionId, NULL_ID};
pub use message::{Message, MessageKind, SharedMessage, ToolInfo};
