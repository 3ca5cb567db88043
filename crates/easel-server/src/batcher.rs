//! Outbound batching: drains a connection's queue into wire frames.
//!
//! Each flush takes the longest prefix of the queue whose messages share
//! (kind, origin, session), capped at [`MAX_RUN`], and writes it as one
//! frame. The run is a borrowed slice of the queue; messages are only
//! removed after the frame is committed to the output buffer. A run is also
//! cut short so pending output plus the new frame stays within the output
//! buffer's limit; the writer drains the rest before the next flush.

use std::collections::VecDeque;

use easel_core::{ConnectionError, FrameCodec, MessageKind, Run, SharedMessage, MAX_RUN};
use easel_telemetry::metrics::{names, MetricsRecorder};
use serde::Serialize;

use crate::connection::Connection;

/// Outcome of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub kind: MessageKind,
    /// Messages combined into the frame.
    pub count: usize,
    /// Frame size in bytes.
    pub bytes: usize,
    /// Whether the output buffer was replaced to fit the frame.
    pub grew: bool,
}

/// Totals for a full drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub frames: usize,
    pub messages: usize,
    pub bytes: usize,
    pub growths: usize,
    /// Messages are still queued behind unsent output.
    pub backlogged: bool,
}

/// Length of the homogeneous run at the head of `queue`.
pub fn run_length(queue: &VecDeque<SharedMessage>) -> usize {
    let Some(head) = queue.front() else {
        return 0;
    };
    queue
        .iter()
        .take(MAX_RUN)
        .take_while(|message| head.same_batch(message))
        .count()
}

/// Longest prefix of `messages` whose frame fits in `budget` bytes.
fn fitting_run<'a>(
    messages: &'a [SharedMessage],
    codec: &dyn FrameCodec,
    budget: usize,
) -> Option<Run<'a>> {
    let full = Run::new(messages)?;
    if codec.frame_len(&full) <= budget {
        return Some(full);
    }
    // Frame length grows with the run, so binary search the cut.
    let (mut lo, mut hi) = (0, messages.len());
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let run = Run::new(&messages[..mid])?;
        if codec.frame_len(&run) <= budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Run::new(&messages[..lo])
}

/// Serialize the run at the head of the queue as one frame.
///
/// The run is cut short when its frame would not fit in the output
/// buffer's limit. When not even one message fits, the result is
/// [`ConnectionError::OutputFull`] if pending bytes can still drain, or
/// [`ConnectionError::OutOfMemory`] if the buffer is already empty.
pub fn flush(
    connection: &mut Connection,
    codec: &dyn FrameCodec,
) -> Result<FlushReport, ConnectionError> {
    let conn_id = connection.id();
    let (queue, output) = connection.outbound_parts();

    let len = run_length(queue);
    if len == 0 {
        return Err(ConnectionError::EmptyQueue);
    }

    let budget = output.frame_budget();
    let report = {
        let messages = &queue.make_contiguous()[..len];
        let Some(run) = fitting_run(messages, codec, budget) else {
            if !output.is_empty() {
                return Err(ConnectionError::OutputFull {
                    pending: output.len(),
                });
            }
            let single = Run::new(&messages[..1]).ok_or(ConnectionError::EmptyQueue)?;
            return Err(ConnectionError::OutOfMemory {
                requested: codec.frame_len(&single),
            });
        };
        let frame_len = codec.frame_len(&run);
        let grew = output.write_frame(frame_len, |dst| codec.encode(&run, dst))?;
        FlushReport {
            kind: run.head().kind,
            count: run.len(),
            bytes: frame_len,
            grew,
        }
    };
    queue.drain(..report.count);

    if report.grew {
        tracing::debug!(
            conn_id = %conn_id,
            capacity = output.capacity(),
            generation = output.generation(),
            "Output buffer grown"
        );
    }
    tracing::trace!(
        conn_id = %conn_id,
        kind = report.kind.as_str(),
        count = report.count,
        bytes = report.bytes,
        "Frame flushed"
    );
    Ok(report)
}

/// Flush until the queue is empty or the output buffer has to drain
/// before the next frame fits.
pub fn flush_all(
    connection: &mut Connection,
    codec: &dyn FrameCodec,
    metrics: Option<&MetricsRecorder>,
) -> Result<FlushSummary, ConnectionError> {
    let mut summary = FlushSummary::default();
    while connection.queue_len() > 0 {
        let report = match flush(connection, codec) {
            Ok(report) => report,
            Err(ConnectionError::OutputFull { .. }) => {
                summary.backlogged = true;
                break;
            }
            Err(err) => return Err(err),
        };
        summary.frames += 1;
        summary.messages += report.count;
        summary.bytes += report.bytes;
        if report.grew {
            summary.growths += 1;
        }
        if let Some(metrics) = metrics {
            record(metrics, &report);
        }
    }
    Ok(summary)
}

fn record(metrics: &MetricsRecorder, report: &FlushReport) {
    let labels = [("kind", report.kind.as_str())];
    metrics.counter_inc(names::FRAMES_SENT, &labels, 1);
    metrics.counter_inc(names::MESSAGES_BATCHED, &labels, report.count as u64);
    metrics.histogram_observe(names::BATCH_SIZE, &[], report.count as f64);
    if report.grew {
        metrics.counter_inc(names::BUFFER_GROWTHS, &[], 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputBuffer;
    use bytes::Bytes;
    use easel_core::{ConnectionId, CountedFrameCodec, Frame, Message, SessionId};
    use tokio_util::codec::Decoder;

    fn connection(initial: usize, max: usize) -> Connection {
        let output = OutputBuffer::with_capacity(initial, max).unwrap();
        Connection::new(1, "127.0.0.1:9000".parse().unwrap(), output).unwrap()
    }

    fn msg(kind: MessageKind, origin: u8, payload: &[u8]) -> SharedMessage {
        Message::new(
            kind,
            ConnectionId::new(origin),
            SessionId::new(1),
            Bytes::copy_from_slice(payload),
        )
        .unwrap()
        .shared()
    }

    fn stroke(origin: u8) -> SharedMessage {
        msg(MessageKind::StrokeInfo, origin, &[origin, 0xAA])
    }

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut buf = bytes::BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = CountedFrameCodec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn homogeneous_run_is_one_frame() {
        let mut conn = connection(4096, 1 << 20);
        for _ in 0..10 {
            conn.enqueue(stroke(2)).unwrap();
        }

        let report = flush(&mut conn, &CountedFrameCodec).unwrap();
        assert_eq!(report.count, 10);
        assert_eq!(report.bytes, 4 + 10 * 4);
        assert_eq!(conn.queue_len(), 0);

        let frames = decode_all(conn.output().pending());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].count(), 10);
        assert_eq!(frames[0].origin, ConnectionId::new(2));
    }

    #[test]
    fn full_run_of_255_is_one_frame() {
        let mut conn = connection(4096, 1 << 20);
        for _ in 0..MAX_RUN {
            conn.enqueue(stroke(2)).unwrap();
        }
        let report = flush(&mut conn, &CountedFrameCodec).unwrap();
        assert_eq!(report.count, MAX_RUN);
        assert_eq!(conn.queue_len(), 0);
    }

    #[test]
    fn long_run_is_capped() {
        let mut conn = connection(4096, 1 << 20);
        for _ in 0..300 {
            conn.enqueue(stroke(2)).unwrap();
        }

        let report = flush(&mut conn, &CountedFrameCodec).unwrap();
        assert_eq!(report.count, 255);
        assert_eq!(conn.queue_len(), 45);

        let frames = decode_all(conn.output().pending());
        assert_eq!(frames[0].count(), 255);
    }

    #[test]
    fn mixed_queue_splits_on_every_change() {
        let mut conn = connection(4096, 1 << 20);
        conn.enqueue(stroke(2)).unwrap();
        conn.enqueue(stroke(2)).unwrap();
        conn.enqueue(stroke(3)).unwrap();
        conn.enqueue(stroke(2)).unwrap();

        let counts: Vec<_> = (0..3)
            .map(|_| flush(&mut conn, &CountedFrameCodec).unwrap().count)
            .collect();
        assert_eq!(counts, vec![2, 1, 1]);
        assert!(matches!(
            flush(&mut conn, &CountedFrameCodec),
            Err(ConnectionError::EmptyQueue)
        ));
    }

    #[test]
    fn kind_change_breaks_run() {
        let mut conn = connection(4096, 1 << 20);
        conn.enqueue(msg(MessageKind::StrokeInfo, 2, b"a")).unwrap();
        conn.enqueue(msg(MessageKind::StrokeEnd, 2, b"")).unwrap();

        assert_eq!(flush(&mut conn, &CountedFrameCodec).unwrap().count, 1);
        let report = flush(&mut conn, &CountedFrameCodec).unwrap();
        assert_eq!(report.kind, MessageKind::StrokeEnd);
    }

    #[test]
    fn empty_queue_is_an_error() {
        let mut conn = connection(64, 64);
        let err = flush(&mut conn, &CountedFrameCodec).unwrap_err();
        assert!(matches!(err, ConnectionError::EmptyQueue));
        assert!(conn.output().is_empty());
    }

    #[test]
    fn small_buffer_grows_without_losing_bytes() {
        let mut conn = connection(16, 1 << 20);
        conn.set_extensions(easel_core::Extensions::ALL);
        conn.enqueue(msg(MessageKind::Chat, 4, b"hi")).unwrap();
        flush(&mut conn, &CountedFrameCodec).unwrap();
        let before = conn.output().pending().to_vec();
        let generation = conn.output().generation();

        for _ in 0..20 {
            conn.enqueue(stroke(2)).unwrap();
        }
        let report = flush(&mut conn, &CountedFrameCodec).unwrap();
        assert!(report.grew);
        assert_ne!(conn.output().generation(), generation);

        let pending = conn.output().pending();
        assert_eq!(&pending[..before.len()], &before[..]);
        assert_eq!(pending.len(), before.len() + report.bytes);

        let frames = decode_all(pending);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, MessageKind::Chat);
        assert_eq!(frames[0].count(), 1);
        assert_eq!(frames[1].count(), 20);
    }

    #[test]
    fn message_larger_than_buffer_limit_is_out_of_memory() {
        let mut conn = connection(4, 4);
        for _ in 0..4 {
            conn.enqueue(stroke(2)).unwrap();
        }
        let err = flush(&mut conn, &CountedFrameCodec).unwrap_err();
        assert!(matches!(err, ConnectionError::OutOfMemory { requested: 8 }));
        assert!(err.is_fatal());
        assert_eq!(conn.queue_len(), 4);
        assert!(conn.output().is_empty());
    }

    const LIMIT: usize = 4 << 20;

    fn large(origin: u8, payload: &Bytes) -> SharedMessage {
        Message::new(
            MessageKind::StrokeInfo,
            ConnectionId::new(origin),
            SessionId::new(1),
            payload.clone(),
        )
        .unwrap()
        .shared()
    }

    /// Flush and write out everything, as the writer task does.
    fn drain(conn: &mut Connection) -> (usize, Vec<Frame>) {
        let mut messages = 0;
        let mut frames = Vec::new();
        while conn.queue_len() > 0 {
            let summary = flush_all(conn, &CountedFrameCodec, None).unwrap();
            assert!(conn.output().len() <= LIMIT);
            messages += summary.messages;
            let pending = conn.output_mut().take_pending(Vec::new());
            frames.extend(decode_all(&pending));
        }
        (messages, frames)
    }

    #[test]
    fn long_run_is_cut_to_fit_buffer_limit() {
        let payload = Bytes::from(vec![7u8; 60_000]);
        let mut conn = connection(4096, LIMIT);
        for _ in 0..100 {
            conn.enqueue(large(2, &payload)).unwrap();
        }

        let report = flush(&mut conn, &CountedFrameCodec).unwrap();
        assert_eq!(report.count, 69);
        assert!(report.bytes <= LIMIT);
        assert_eq!(conn.queue_len(), 31);

        let err = flush(&mut conn, &CountedFrameCodec).unwrap_err();
        assert!(matches!(err, ConnectionError::OutputFull { .. }));
        assert!(!err.is_fatal());
        assert_eq!(conn.queue_len(), 31);

        let (messages, frames) = drain(&mut conn);
        assert_eq!(messages, 31);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].count(), 69);
        assert_eq!(frames[1].count(), 31);
    }

    #[test]
    fn backlog_larger_than_buffer_limit_drains_in_rounds() {
        let payload = Bytes::from(vec![7u8; 60_000]);
        let mut conn = connection(4096, LIMIT);
        for i in 0..100u8 {
            conn.enqueue(large(1 + i % 2, &payload)).unwrap();
        }

        let summary = flush_all(&mut conn, &CountedFrameCodec, None).unwrap();
        assert!(summary.backlogged);
        assert_eq!(summary.messages, 69);
        assert_eq!(conn.queue_len(), 31);

        let written = conn.output().len();
        conn.output_mut().consume(written);
        let (messages, frames) = drain(&mut conn);
        assert_eq!(messages, 31);
        assert_eq!(frames.len(), 31);
        assert!(frames.iter().all(|f| f.payloads[0].len() == 60_000));
    }

    #[test]
    fn lying_codec_is_rolled_back() {
        struct ShortCodec;
        impl FrameCodec for ShortCodec {
            fn frame_len(&self, run: &Run<'_>) -> usize {
                run.len() + 1
            }
            fn encode(&self, run: &Run<'_>, dst: &mut Vec<u8>) {
                dst.extend(std::iter::repeat(0u8).take(run.len()));
            }
        }

        let mut conn = connection(64, 64);
        conn.enqueue(stroke(2)).unwrap();
        let err = flush(&mut conn, &ShortCodec).unwrap_err();
        assert!(matches!(err, ConnectionError::FrameLengthMismatch { .. }));
        assert!(conn.output().is_empty());
        assert_eq!(conn.queue_len(), 1);
    }

    #[test]
    fn shared_messages_survive_flush_elsewhere() {
        let mut a = connection(256, 1024);
        let mut b = connection(256, 1024);
        let message = stroke(5);
        a.enqueue(std::sync::Arc::clone(&message)).unwrap();
        b.enqueue(std::sync::Arc::clone(&message)).unwrap();

        flush(&mut a, &CountedFrameCodec).unwrap();
        assert_eq!(b.queued().next().map(|m| m.payload.clone()), Some(message.payload.clone()));
        assert_eq!(std::sync::Arc::strong_count(&message), 2);
    }

    #[test]
    fn flush_all_drains_and_records_metrics() {
        let metrics = MetricsRecorder::new();
        let mut conn = connection(16, 1 << 20);
        for _ in 0..300 {
            conn.enqueue(stroke(2)).unwrap();
        }
        conn.enqueue(stroke(3)).unwrap();

        let summary = flush_all(&mut conn, &CountedFrameCodec, Some(&metrics)).unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.messages, 301);
        assert!(summary.growths >= 1);
        assert!(!summary.backlogged);
        assert_eq!(conn.queue_len(), 0);

        let labels = [("kind", "stroke_info")];
        assert_eq!(metrics.counter_get(names::FRAMES_SENT, &labels), 3);
        assert_eq!(metrics.counter_get(names::MESSAGES_BATCHED, &labels), 301);
        let sizes = metrics.histogram_summary(names::BATCH_SIZE, &[]);
        assert_eq!(sizes.count, 3);
        assert_eq!(sizes.max, 255.0);
    }

    #[test]
    fn run_length_helper() {
        let mut queue = VecDeque::new();
        assert_eq!(run_length(&queue), 0);
        queue.push_back(stroke(1));
        queue.push_back(stroke(1));
        queue.push_back(stroke(2));
        assert_eq!(run_length(&queue), 2);
    }
}
