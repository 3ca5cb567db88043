//! Batched frame wire format.
//!
//! A frame carries one or more messages sharing (kind, origin, session):
//!
//! ```text
//! [kind u8][origin u8][session u8][count u8] { [len u16 BE][payload] } * count
//! ```
//!
//! The count is a single byte, which caps a run at [`MAX_RUN`] messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::errors::ConnectionError;
use crate::ids::{ConnectionId, SessionId};
use crate::message::{Message, MessageKind, SharedMessage};

/// Largest number of messages one frame can carry.
pub const MAX_RUN: usize = u8::MAX as usize;

pub const FRAME_HEADER_LEN: usize = 4;
pub const ENTRY_HEADER_LEN: usize = 2;

/// A homogeneous run of queued messages, borrowed from the outbound queue
/// for the duration of one flush.
///
/// Slice adjacency is the chain: [`Run::next`] and [`Run::prev`] walk it in
/// either direction without touching the shared message records.
#[derive(Clone, Copy, Debug)]
pub struct Run<'a> {
    messages: &'a [SharedMessage],
}

impl<'a> Run<'a> {
    /// Returns `None` unless `messages` is non-empty, at most [`MAX_RUN`]
    /// long, and every element shares the head's batch key.
    pub fn new(messages: &'a [SharedMessage]) -> Option<Self> {
        let head = messages.first()?;
        if messages.len() > MAX_RUN || !messages.iter().all(|m| head.same_batch(m)) {
            return None;
        }
        Some(Self { messages })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Wire count byte. Never truncates: `new` enforces the cap.
    pub fn count(&self) -> u8 {
        self.messages.len() as u8
    }

    pub fn head(&self) -> &'a Message {
        &self.messages[0]
    }

    pub fn tail(&self) -> &'a Message {
        &self.messages[self.messages.len() - 1]
    }

    pub fn get(&self, index: usize) -> Option<&'a Message> {
        self.messages.get(index).map(|m| m.as_ref())
    }

    pub fn next(&self, index: usize) -> Option<&'a Message> {
        self.get(index.checked_add(1)?)
    }

    pub fn prev(&self, index: usize) -> Option<&'a Message> {
        self.get(index.checked_sub(1)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Message> + 'a {
        let messages = self.messages;
        messages.iter().map(|m| m.as_ref())
    }
}

/// Per-type frame serializer. Implementations must write exactly
/// `frame_len(run)` bytes in `encode`.
pub trait FrameCodec: Send + Sync {
    fn frame_len(&self, run: &Run<'_>) -> usize;

    fn encode(&self, run: &Run<'_>, dst: &mut Vec<u8>);
}

/// Default codec: counted frames with u16 length-prefixed payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountedFrameCodec;

impl FrameCodec for CountedFrameCodec {
    fn frame_len(&self, run: &Run<'_>) -> usize {
        FRAME_HEADER_LEN
            + run
                .iter()
                .map(|m| ENTRY_HEADER_LEN + m.payload.len())
                .sum::<usize>()
    }

    fn encode(&self, run: &Run<'_>, dst: &mut Vec<u8>) {
        let head = run.head();
        dst.put_u8(head.kind.into());
        dst.put_u8(ConnectionId::to_wire(head.origin));
        dst.put_u8(SessionId::to_wire(head.session));
        dst.put_u8(run.count());
        for message in run.iter() {
            dst.put_u16(message.payload.len() as u16);
            dst.put_slice(&message.payload);
        }
    }
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub origin: Option<ConnectionId>,
    pub session: Option<SessionId>,
    pub payloads: Vec<Bytes>,
}

impl Frame {
    pub fn count(&self) -> usize {
        self.payloads.len()
    }

    /// Split into individual messages, stamping each with `origin`.
    pub fn into_messages(self, origin: Option<ConnectionId>) -> Vec<Message> {
        let Frame {
            kind,
            session,
            payloads,
            ..
        } = self;
        payloads
            .into_iter()
            .map(|payload| Message {
                kind,
                origin,
                session,
                payload,
            })
            .collect()
    }
}

impl Decoder for CountedFrameCodec {
    type Item = Frame;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ConnectionError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let count = src[3] as usize;
        if count == 0 {
            return Err(ConnectionError::Protocol("frame with zero entries".into()));
        }

        let mut total = FRAME_HEADER_LEN;
        for _ in 0..count {
            if src.len() < total + ENTRY_HEADER_LEN {
                src.reserve(total + ENTRY_HEADER_LEN - src.len());
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[total], src[total + 1]]) as usize;
            total += ENTRY_HEADER_LEN + len;
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total).freeze();
        let kind = MessageKind::from(frame.get_u8());
        let origin = ConnectionId::from_wire(frame.get_u8());
        let session = SessionId::from_wire(frame.get_u8());
        frame.advance(1);

        let mut payloads = Vec::with_capacity(count);
        for _ in 0..count {
            let len = frame.get_u16() as usize;
            payloads.push(frame.split_to(len));
        }

        Ok(Some(Frame {
            kind,
            origin,
            session,
            payloads,
        }))
    }
}
