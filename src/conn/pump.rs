//! Reader and writer pumps: the only two tasks touching the transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use super::ConnShared;
use crate::stream::Stream;
use crate::types::{Error, ErrorClass, Result};
use crate::wire::frame::{decode_error, decode_window_update};
use crate::wire::{read_frame, write_frame, Frame, FrameKind, InvokePayload};

/// Read frames and route them to streams until the transport ends or the
/// connection is torn down.
pub(crate) async fn run_reader<R: AsyncRead + Unpin>(
    shared: Arc<ConnShared>,
    mut reader: R,
    incoming: Option<mpsc::Sender<Stream>>,
) {
    let max_payload = shared.config().max_frame_payload;
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = read_frame(&mut reader, max_payload) => next,
        };
        let outcome = match next {
            Ok(Some(frame)) => route(&shared, frame, incoming.as_ref()).await,
            Ok(None) => Err(Error::connection_closed("closed by peer")),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            if err.is(ErrorClass::Protocol) {
                tracing::warn!(conn = %shared.id, error = %err, "connection protocol violation");
            } else {
                tracing::debug!(conn = %shared.id, error = %err, "reader stopped");
            }
            shared.teardown(err);
            break;
        }
    }
}

/// Route one frame. An `Err` is fatal to the connection.
async fn route(
    shared: &Arc<ConnShared>,
    frame: Frame,
    incoming: Option<&mpsc::Sender<Stream>>,
) -> Result<()> {
    let id = frame.stream_id;
    if frame.kind == FrameKind::Invoke {
        return open_inbound(shared, frame, incoming).await;
    }

    let Some(stream) = shared.lookup(id) else {
        if !shared.has_opened(id) {
            return Err(Error::protocol(format!(
                "{:?} frame for unopened stream {}",
                frame.kind, id
            )));
        }
        tracing::debug!(conn = %shared.id, stream = %id, kind = ?frame.kind, "dropping frame for closed stream");
        return Ok(());
    };

    match frame.kind {
        FrameKind::MessageData | FrameKind::MessageDataEnd => {
            let delivered = stream
                .on_data(frame.kind, &frame.payload)
                .and_then(|message| message.map_or(Ok(()), |m| stream.deliver(m)));
            if let Err(err) = delivered {
                tracing::warn!(conn = %shared.id, stream = %id, error = %err, "terminating stream");
                let _ = stream.send_error(&err);
            }
        }
        FrameKind::WindowUpdate => stream.on_window_update(decode_window_update(&frame.payload)?),
        FrameKind::CloseSend => stream.on_remote_close_send(),
        FrameKind::Close => stream.on_remote_close(),
        FrameKind::Error => {
            let err = decode_error(&frame.payload).unwrap_or_else(|malformed| malformed);
            stream.on_remote_error(err);
        }
        FrameKind::Invoke => {}
    }
    Ok(())
}

/// Handle an `Invoke` frame: create the stream and hand it to the server.
async fn open_inbound(
    shared: &Arc<ConnShared>,
    frame: Frame,
    incoming: Option<&mpsc::Sender<Stream>>,
) -> Result<()> {
    let id = frame.stream_id;
    let Some(incoming) = incoming else {
        tracing::warn!(conn = %shared.id, stream = %id, "peer invoked an rpc on a client connection");
        let err = Error::protocol("connection does not accept invocations");
        return shared.outbox.push(Frame::error(id, &err), None);
    };

    // Out-of-order or reused ids mean the two sides disagree on stream state.
    shared.accept_id(id)?;

    let invoke = match InvokePayload::decode(frame.payload) {
        Ok(invoke) => invoke,
        Err(err) => {
            tracing::warn!(conn = %shared.id, stream = %id, error = %err, "rejecting invoke");
            return shared.outbox.push(Frame::error(id, &err), None);
        }
    };

    let stream = Stream::new(shared.clone(), id, invoke.rpc, None);
    stream.mark_open();
    shared.register(stream.clone())?;
    tracing::trace!(conn = %shared.id, stream = %id, rpc = stream.rpc(), "stream opened by peer");

    if let Some(message) = invoke.message {
        stream.deliver(message)?;
    }

    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        sent = incoming.send(stream.clone()) => {
            if sent.is_err() {
                stream.terminate(Error::canceled("server is not accepting streams"), true);
            }
        }
    }
    Ok(())
}

/// Upper bound on closing the transport once the connection is torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Write queued frames until the connection is torn down, then close the
/// write side of the transport.
pub(crate) async fn run_writer<W: AsyncWrite + Unpin>(shared: Arc<ConnShared>, writer: W) {
    let mut writer = BufWriter::new(writer);
    let write_timeout = shared.config().write_timeout;
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => None,
            next = shared.outbox.next() => next,
        };
        let Some(outgoing) = next else {
            break;
        };

        // Teardown interrupts a write stuck on a peer that stopped reading.
        let written = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            written = timed_write(write_timeout, write_frame(&mut writer, &outgoing.frame)) => written,
        };
        if let Err(err) = written {
            shared.teardown(err);
            break;
        }
        drop(outgoing);

        if shared.outbox.is_empty() {
            let flushed = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                flushed = timed_write(write_timeout, async {
                    writer.flush().await.map_err(Error::from)
                }) => flushed,
            };
            if let Err(err) = flushed {
                shared.teardown(err);
                break;
            }
        }
    }

    // Best effort: the peer may already be gone or not reading.
    let grace = write_timeout.min(SHUTDOWN_GRACE);
    let _ = tokio::time::timeout(grace, writer.shutdown()).await;
    shared.finished.cancel();
    tracing::debug!(conn = %shared.id, "writer stopped");
}

/// Run a write with a timeout. A peer that stops reading must not hold the
/// connection forever.
async fn timed_write<F>(timeout: Duration, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(timeout, write).await.map_err(|_| {
        tracing::warn!("Write timeout ({}s), dropping connection", timeout.as_secs());
        Error::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timeout",
        ))
    })?
}
