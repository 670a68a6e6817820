//! Connection multiplexer.
//!
//! A connection owns one transport and turns it into many independent
//! streams. Exactly two tasks touch the transport: the reader pump, which
//! routes incoming frames to streams by id, and the writer pump, which drains
//! the shared outbox.
//!
//! ```text
//!   Conn::invoke / new_stream          server dispatch
//!              │                              ▲
//!              ▼                              │ incoming streams
//!   ┌─────────────────────┐      ┌─────────────────────────┐
//!   │ Stream ─► Outbox    │      │ reader: route by id     │
//!   └────────┬────────────┘      └───────────▲─────────────┘
//!            ▼                               │
//!       writer pump ──► transport ──► ... ──► reader pump
//! ```
//!
//! On the client side only one call or stream may be active per `Conn`.
//! Callers that need concurrency open more connections.

mod outbox;
mod pump;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::message::Message;
use crate::stream::Stream;
use crate::types::{ConnConfig, ConnId, Error, Result, StreamId};

pub(crate) use outbox::Outbox;

/// A duplex byte stream a connection can run over: TCP, unix sockets,
/// in-memory pipes, TLS streams.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Opens streams; rejects peer invocations.
    Client,
    /// Accepts streams opened by the peer.
    Server,
}

/// State shared by the connection handle, its pumps and its streams.
pub(crate) struct ConnShared {
    pub(crate) id: ConnId,
    role: Role,
    config: ConnConfig,
    pub(crate) outbox: Outbox,
    streams: Mutex<HashMap<StreamId, Stream>>,
    /// Highest stream id allocated (client) or accepted (server).
    last_id: AtomicU32,
    /// Canceled exactly once, on teardown.
    pub(crate) cancel: CancellationToken,
    cause: OnceLock<Error>,
    /// Canceled when the writer pump has shut the transport down.
    pub(crate) finished: CancellationToken,
}

impl ConnShared {
    fn new(config: ConnConfig, role: Role) -> Self {
        Self {
            id: ConnId::new(),
            role,
            config,
            outbox: Outbox::new(),
            streams: Mutex::new(HashMap::new()),
            last_id: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            cause: OnceLock::new(),
            finished: CancellationToken::new(),
        }
    }

    pub(crate) fn config(&self) -> &ConnConfig {
        &self.config
    }

    pub(crate) fn lookup(&self, id: StreamId) -> Option<Stream> {
        self.streams.lock().get(&id).cloned()
    }

    pub(crate) fn register(&self, stream: Stream) -> Result<()> {
        let mut streams = self.streams.lock();
        if self.cancel.is_cancelled() {
            return Err(self.cause());
        }
        streams.insert(stream.id(), stream);
        Ok(())
    }

    /// Drop a finished stream from the routing table.
    pub(crate) fn forget(&self, id: StreamId) {
        self.streams.lock().remove(&id);
    }

    /// Whether `id` was ever opened on this connection.
    pub(crate) fn has_opened(&self, id: StreamId) -> bool {
        id.get() != 0 && id.get() <= self.last_id.load(Ordering::Acquire)
    }

    fn next_stream_id(&self) -> Result<StreamId> {
        let prev = self
            .last_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map_err(|_| Error::protocol("stream ids exhausted"))?;
        Ok(StreamId::new(prev + 1))
    }

    /// Record a peer-chosen stream id. Ids must strictly increase.
    pub(crate) fn accept_id(&self, id: StreamId) -> Result<()> {
        let last = self.last_id.load(Ordering::Acquire);
        if id.get() <= last {
            return Err(Error::protocol(format!(
                "stream id {} reused or out of order (last {})",
                id, last
            )));
        }
        self.last_id.store(id.get(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn cause(&self) -> Error {
        self.cause
            .get()
            .cloned()
            .unwrap_or_else(|| Error::connection_closed("connection closed"))
    }

    /// Tear the connection down with `cause`. Only the first call has any
    /// effect; every active stream is canceled exactly once.
    pub(crate) fn teardown(&self, cause: Error) {
        if self.cause.set(cause.clone()).is_err() {
            return;
        }
        self.cancel.cancel();
        self.outbox.close();
        let streams: Vec<Stream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        tracing::debug!(
            conn = %self.id,
            role = ?self.role,
            streams = streams.len(),
            cause = %cause,
            "connection torn down"
        );
        for stream in streams {
            stream.terminate(cause.clone(), false);
            stream.release_guard();
        }
    }
}

/// A connection to a peer over a single transport.
///
/// The connection owns the transport outright: it is split between the
/// reader and writer tasks and is not handed back out. Use `id()` to
/// correlate a connection with its log lines.
///
/// Dropping the handle tears the connection down.
pub struct Conn {
    shared: Arc<ConnShared>,
    /// Single-active-call guard.
    guard: Arc<Semaphore>,
}

impl Conn {
    /// Start a client connection over `transport` with default limits.
    ///
    /// Spawns the pumps; must be called within a tokio runtime.
    pub fn new<T: Transport>(transport: T) -> Result<Self> {
        Self::with_config(transport, ConnConfig::default())
    }

    pub fn with_config<T: Transport>(transport: T, config: ConnConfig) -> Result<Self> {
        config.validate()?;
        let (conn, _) = Self::spawn(transport, config, Role::Client);
        Ok(conn)
    }

    /// Start the accepting side of a connection. Streams opened by the peer
    /// arrive on the returned receiver.
    pub(crate) fn accept<T: Transport>(
        transport: T,
        config: ConnConfig,
    ) -> Result<(Self, mpsc::Receiver<Stream>)> {
        config.validate()?;
        let (conn, incoming) = Self::spawn(transport, config, Role::Server);
        let incoming = incoming.ok_or_else(|| Error::internal("server connection without inbox"))?;
        Ok((conn, incoming))
    }

    fn spawn<T: Transport>(
        transport: T,
        config: ConnConfig,
        role: Role,
    ) -> (Self, Option<mpsc::Receiver<Stream>>) {
        let (incoming_tx, incoming_rx) = match role {
            Role::Server => {
                let (tx, rx) = mpsc::channel(config.incoming_stream_capacity);
                (Some(tx), Some(rx))
            }
            Role::Client => (None, None),
        };
        let shared = Arc::new(ConnShared::new(config, role));
        let (reader, writer) = tokio::io::split(transport);

        let span = tracing::debug_span!("conn", id = %shared.id, role = ?role);
        tokio::spawn(pump::run_reader(shared.clone(), reader, incoming_tx).instrument(span.clone()));
        tokio::spawn(pump::run_writer(shared.clone(), writer).instrument(span));
        tracing::debug!(conn = %shared.id, role = ?role, "connection started");

        let conn = Self {
            shared,
            guard: Arc::new(Semaphore::new(1)),
        };
        (conn, incoming_rx)
    }

    pub fn id(&self) -> &ConnId {
        &self.shared.id
    }

    /// Issue a unary rpc: one request, one response.
    ///
    /// Fails at once with a protocol error if another call or stream is
    /// active on this connection. Canceling `ctx` tears the call down.
    pub async fn invoke(
        &self,
        ctx: &CancellationToken,
        rpc: &str,
        input: &dyn Message,
        output: &mut dyn Message,
    ) -> Result<()> {
        let permit = self.acquire_guard()?;
        let encoded = Bytes::from(input.marshal()?);
        let stream = self.open_stream(rpc, permit)?;

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                let cause = Error::canceled("context canceled");
                stream.terminate(cause.clone(), true);
                Err(cause)
            }
            result = unary_exchange(&stream, encoded, output) => result,
        };
        let _ = stream.close();
        result
    }

    /// Open a stream. The connection stays busy until the stream is closed.
    pub async fn new_stream(&self, ctx: &CancellationToken, rpc: &str) -> Result<Stream> {
        let permit = self.acquire_guard()?;
        let stream = self.open_stream(rpc, permit)?;
        if let Err(err) = stream.send_invoke(None).await {
            let _ = stream.close();
            return Err(err);
        }

        let watched = stream.clone();
        let ctx = ctx.clone();
        let conn_cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            let aborted = watched.abort_token();
            tokio::select! {
                _ = ctx.cancelled() => watched.terminate(Error::canceled("context canceled"), true),
                _ = aborted.cancelled() => {}
                _ = conn_cancel.cancelled() => {}
            }
        });
        Ok(stream)
    }

    /// Close the connection: stop both pumps, close the transport and cancel
    /// every active stream. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared
            .teardown(Error::connection_closed("connection closed"));
        self.shared.finished.cancelled().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Wait until the connection is torn down.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Why the connection ended, once it has.
    pub fn cause(&self) -> Option<Error> {
        self.shared.cause.get().cloned()
    }

    fn acquire_guard(&self) -> Result<OwnedSemaphorePermit> {
        if self.is_closed() {
            return Err(self.shared.cause());
        }
        self.guard
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::protocol("connection already in use"))
    }

    fn open_stream(&self, rpc: &str, permit: OwnedSemaphorePermit) -> Result<Stream> {
        let id = self.shared.next_stream_id()?;
        let stream = Stream::new(self.shared.clone(), id, rpc.to_string(), Some(permit));
        self.shared.register(stream.clone())?;
        tracing::trace!(conn = %self.shared.id, stream = %id, rpc, "stream opened");
        Ok(stream)
    }
}

async fn unary_exchange(stream: &Stream, encoded: Bytes, output: &mut dyn Message) -> Result<()> {
    stream.send_invoke(Some(encoded)).await?;
    stream.close_send()?;
    match stream.msg_recv(output).await {
        Err(Error::EndOfStream) => Err(Error::protocol("stream closed without a response")),
        other => other,
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.shared
            .teardown(Error::connection_closed("connection dropped"));
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorClass;
    use crate::wire::{read_frame, write_frame, Frame, FrameKind};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Text {
        data: String,
    }

    /// A client `Conn` wired to a raw duplex end the test drives frame by frame.
    fn raw_peer() -> (Conn, DuplexStream) {
        let (client, peer) = tokio::io::duplex(64 * 1024);
        (Conn::new(client).unwrap(), peer)
    }

    async fn next_frame(peer: &mut DuplexStream) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), read_frame(peer, 1 << 20))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn invoke_writes_invoke_then_close_send() {
        let (conn, mut peer) = raw_peer();
        let call = tokio::spawn(async move {
            let mut out = Text::default();
            let input = Text {
                data: "hi".to_string(),
            };
            let result = conn
                .invoke(&CancellationToken::new(), "Echo", &input, &mut out)
                .await;
            (result, out.data)
        });

        let invoke = next_frame(&mut peer).await;
        assert_eq!(invoke.kind, FrameKind::Invoke);
        assert_eq!(invoke.stream_id, StreamId::new(1));
        let payload = crate::wire::InvokePayload::decode(invoke.payload).unwrap();
        assert_eq!(payload.rpc, "Echo");
        assert_eq!(payload.message.as_deref(), Some(&br#"{"data":"hi"}"#[..]));

        let close_send = next_frame(&mut peer).await;
        assert_eq!(close_send.kind, FrameKind::CloseSend);

        let reply = Frame::new(StreamId::new(1), FrameKind::MessageDataEnd, &br#"{"data":"yo"}"#[..]);
        write_frame(&mut peer, &reply).await.unwrap();
        write_frame(&mut peer, &Frame::control(StreamId::new(1), FrameKind::Close))
            .await
            .unwrap();

        let (result, data) = call.await.unwrap();
        result.unwrap();
        assert_eq!(data, "yo");
    }

    #[tokio::test]
    async fn frame_for_unopened_stream_kills_connection() {
        let (conn, mut peer) = raw_peer();
        let bogus = Frame::new(StreamId::new(42), FrameKind::MessageDataEnd, &b"{}"[..]);
        write_frame(&mut peer, &bogus).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        assert!(conn.cause().unwrap().is(ErrorClass::Protocol));
    }

    #[tokio::test]
    async fn peer_invoke_on_client_is_rejected_per_stream() {
        let (conn, mut peer) = raw_peer();
        let payload = crate::wire::InvokePayload::encode("Echo", None).unwrap();
        write_frame(&mut peer, &Frame::new(StreamId::new(9), FrameKind::Invoke, payload))
            .await
            .unwrap();

        let reply = next_frame(&mut peer).await;
        assert_eq!(reply.kind, FrameKind::Error);
        assert_eq!(reply.stream_id, StreamId::new(9));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn remote_error_reaches_pending_invoke() {
        let (conn, mut peer) = raw_peer();
        let call = tokio::spawn(async move {
            let mut out = Text::default();
            conn.invoke(&CancellationToken::new(), "Nope", &Text::default(), &mut out)
                .await
        });
        let _invoke = next_frame(&mut peer).await;
        let err = Error::protocol("unknown rpc: Nope");
        write_frame(&mut peer, &Frame::error(StreamId::new(1), &err))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is(ErrorClass::Protocol));
        assert!(matches!(err, Error::Remote { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_calls() {
        let (conn, _peer) = raw_peer();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        let mut out = Text::default();
        let err = conn
            .invoke(&CancellationToken::new(), "Echo", &Text::default(), &mut out)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
