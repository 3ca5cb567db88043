use std::sync::Arc;
use std::time::Duration;

use easel_core::{ConnectionError, CountedFrameCodec};
use easel_telemetry::metrics::names;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use crate::batcher;
use crate::dispatch::Hub;
use crate::registry::ConnectionHandle;

const READ_CHUNK: usize = 4096;

/// Drive one accepted socket until either side closes, then tear the
/// connection down.
pub async fn serve_connection(stream: TcpStream, handle: Arc<ConnectionHandle>, hub: Arc<Hub>) {
    let id = handle.id();
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();

    let mut writer = tokio::spawn(write_loop(wr, Arc::clone(&handle), Arc::clone(&hub)));
    let mut reader = tokio::spawn(read_loop(rd, Arc::clone(&handle), Arc::clone(&hub)));

    let result = tokio::select! {
        r = &mut writer => r,
        r = &mut reader => r,
        _ = handle.closed() => Ok(Ok(())),
    };
    writer.abort();
    reader.abort();

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            hub.metrics()
                .counter_inc(names::ERRORS, &[("kind", err.error_kind())], 1);
            if err.is_fatal() {
                tracing::warn!(conn_id = %id, error = %err, kind = err.error_kind(), "Closing connection");
            } else {
                tracing::debug!(conn_id = %id, error = %err, "Connection ended");
            }
        }
        Err(join_err) if join_err.is_cancelled() => {}
        Err(join_err) => {
            tracing::error!(conn_id = %id, error = %join_err, "Connection task failed");
        }
    }

    hub.disconnect(id);
    tracing::info!(conn_id = %id, "Connection closed");
}

/// Read bytes, assemble frames in the connection's inbound buffer and
/// dispatch them outside the lock.
async fn read_loop(
    mut rd: OwnedReadHalf,
    handle: Arc<ConnectionHandle>,
    hub: Arc<Hub>,
) -> Result<(), ConnectionError> {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut decoder = CountedFrameCodec;

    loop {
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }

        let frames = {
            let mut conn = handle.lock();
            conn.touch();
            let buf = conn.inbound_buffer();
            buf.extend_from_slice(&chunk[..n]);
            let mut frames = Vec::new();
            while let Some(frame) = decoder.decode(buf)? {
                frames.push(frame);
            }
            if buf.is_empty() {
                conn.release_inbound();
            }
            frames
        };

        for frame in frames {
            hub.handle_frame(handle.id(), frame)?;
        }
    }
}

/// Wait for queued messages, batch them into the output buffer and write
/// the pending bytes out. Two vectors alternate: the writer sends one while
/// new frames land in the other.
async fn write_loop(
    mut wr: OwnedWriteHalf,
    handle: Arc<ConnectionHandle>,
    hub: Arc<Hub>,
) -> Result<(), ConnectionError> {
    let mut spare = Vec::new();
    loop {
        handle.writable().await;

        loop {
            let pending = {
                let mut conn = handle.lock();
                if conn.queue_len() > 0 {
                    batcher::flush_all(&mut conn, hub.codec(), Some(hub.metrics()))?;
                }
                if conn.output().is_empty() {
                    break;
                }
                conn.output_mut().take_pending(std::mem::take(&mut spare))
            };
            wr.write_all(&pending).await?;
            spare = pending;
        }
    }
}

/// Start a background task that periodically disconnects idle connections.
pub fn start_cleanup_task(
    hub: Arc<Hub>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = hub.disconnect_idle(tokio::time::Instant::now());
                    if removed > 0 {
                        tracing::info!(removed, "Idle connection cleanup");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
