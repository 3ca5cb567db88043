//! Capability and extension negotiation.
//!
//! Both flag groups arrive as a single byte during the handshake and are
//! cached as plain booleans on the connection so per-message checks never
//! touch the raw bits again. Decoding ignores bits that have no meaning;
//! encoding only ever emits defined bits.

use serde::Serialize;

use crate::message::MessageKind;

/// Named bit positions of the capabilities and extensions bytes.
pub mod bits {
    /// Client wants acknowledgements for completed strokes.
    pub const ACK_FEEDBACK: u8 = 0x01;

    /// Payload compression.
    pub const DEFLATE: u8 = 0x01;
    /// Chat messages.
    pub const CHAT: u8 = 0x02;
    /// Shared palette messages.
    pub const PALETTE: u8 = 0x04;
}

/// Client capabilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub ack_feedback: bool,
}

impl Capabilities {
    /// Every bit this group defines.
    pub const MASK: u8 = bits::ACK_FEEDBACK;

    pub const fn decode(byte: u8) -> Self {
        Self {
            ack_feedback: byte & bits::ACK_FEEDBACK != 0,
        }
    }

    pub const fn encode(self) -> u8 {
        if self.ack_feedback {
            bits::ACK_FEEDBACK
        } else {
            0
        }
    }
}

/// Protocol extensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Extensions {
    pub deflate: bool,
    pub chat: bool,
    pub palette: bool,
}

impl Extensions {
    /// Every bit this group defines.
    pub const MASK: u8 = bits::DEFLATE | bits::CHAT | bits::PALETTE;

    pub const ALL: Self = Self {
        deflate: true,
        chat: true,
        palette: true,
    };

    pub const fn decode(byte: u8) -> Self {
        Self {
            deflate: byte & bits::DEFLATE != 0,
            chat: byte & bits::CHAT != 0,
            palette: byte & bits::PALETTE != 0,
        }
    }

    pub const fn encode(self) -> u8 {
        let mut byte = 0;
        if self.deflate {
            byte |= bits::DEFLATE;
        }
        if self.chat {
            byte |= bits::CHAT;
        }
        if self.palette {
            byte |= bits::PALETTE;
        }
        byte
    }

    /// Features both sides support.
    pub const fn intersect(self, other: Self) -> Self {
        Self {
            deflate: self.deflate && other.deflate,
            chat: self.chat && other.chat,
            palette: self.palette && other.palette,
        }
    }

    /// Whether a connection with these extensions may receive `kind`.
    pub const fn permits(self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Chat => self.chat,
            MessageKind::Palette => self.palette,
            _ => true,
        }
    }
}
