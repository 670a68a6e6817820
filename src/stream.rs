//! Stream engine: one logical exchange on a connection.
//!
//! A `Stream` turns `msg_send`/`msg_recv`/`close_send`/`close` into frames and
//! incoming frames into delivered messages. The connection's reader pump is
//! the only code that feeds it; the connection's writer pump is the only code
//! that drains it.
//!
//! Flow control is per stream and counted in messages. A sender may have at
//! most `stream_recv_capacity` messages the peer has not consumed yet; the
//! receiver hands window back with `WindowUpdate` frames as `msg_recv` takes
//! messages. A full receive queue therefore means the peer ignored its
//! window, and only that stream fails.
//!
//! ```text
//!            close_send (local)             CloseSend (remote)
//!   Idle ──► Open ─────────────► HalfClosedLocal ───────────────► Closed
//!             │                                                      ▲
//!             └──────────────► HalfClosedRemote ─────────────────────┘
//!            CloseSend (remote)              close_send (local)
//!
//!   any state ── cancel / teardown / Error ──► Canceled
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::conn::ConnShared;
use crate::message::Message;
use crate::types::{Error, Result, StreamId};
use crate::wire::frame::chunk_message;
use crate::wire::{Frame, FrameKind, InvokePayload, Reassembler};

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, `Invoke` not yet sent.
    Idle,
    /// Both directions open.
    Open,
    /// We sent `CloseSend`; the peer may still send.
    HalfClosedLocal,
    /// The peer sent `CloseSend`; we may still send.
    HalfClosedRemote,
    /// Both directions finished normally, or the stream was closed.
    Closed,
    /// Terminated by cancellation, connection teardown or an error.
    Canceled,
}

impl StreamState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Canceled)
    }

    pub const fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub const fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub(crate) const fn on_open(self) -> Self {
        match self {
            StreamState::Idle => StreamState::Open,
            other => other,
        }
    }

    pub(crate) const fn on_local_close_send(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    pub(crate) const fn on_remote_close_send(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    pub(crate) const fn on_close(self) -> Self {
        match self {
            StreamState::Canceled => StreamState::Canceled,
            _ => StreamState::Closed,
        }
    }

    pub(crate) const fn on_cancel(self) -> Self {
        match self {
            StreamState::Closed => StreamState::Closed,
            _ => StreamState::Canceled,
        }
    }
}

struct StreamInner {
    id: StreamId,
    rpc: String,
    conn: Arc<ConnShared>,
    /// Local termination: close, cancel, teardown. Wakes `msg_recv` at once.
    abort: CancellationToken,
    /// Public context; child of `abort`, also canceled by remote Close/Error.
    ctx: CancellationToken,
    state: Mutex<StreamState>,
    /// Terminal cause reported once the queue is drained (or at once when
    /// aborted).
    cause: Mutex<Option<Error>>,
    /// Reader-side sender; dropped when the receive side closes.
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    receiver: AsyncMutex<mpsc::Receiver<Bytes>>,
    reassembly: Mutex<Reassembler>,
    send_gate: AsyncMutex<()>,
    credits: Arc<Semaphore>,
    /// Messages the peer is still willing to queue for us.
    window: Semaphore,
    window_capacity: u32,
    /// Messages taken by `msg_recv` not yet granted back to the peer.
    consumed: Mutex<u32>,
    /// Client single-call guard, released on `close`.
    guard: Mutex<Option<OwnedSemaphorePermit>>,
}

/// A bidirectional stream of messages with the peer.
///
/// Cloning yields another handle to the same stream. At most one `msg_send`
/// and one `msg_recv` may be in flight at a time across all handles.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(
        conn: Arc<ConnShared>,
        id: StreamId,
        rpc: String,
        guard: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let config = conn.config();
        let (tx, rx) = mpsc::channel(config.stream_recv_capacity);
        let reassembly = Reassembler::new(config.max_message_bytes);
        let credits = Arc::new(Semaphore::new(config.stream_send_capacity));
        let window_capacity = u32::try_from(config.stream_recv_capacity).unwrap_or(u32::MAX);
        let abort = CancellationToken::new();
        let ctx = abort.child_token();
        Self {
            inner: Arc::new(StreamInner {
                id,
                rpc,
                conn,
                abort,
                ctx,
                state: Mutex::new(StreamState::Idle),
                cause: Mutex::new(None),
                inbound: Mutex::new(Some(tx)),
                receiver: AsyncMutex::new(rx),
                reassembly: Mutex::new(reassembly),
                send_gate: AsyncMutex::new(()),
                credits,
                window: Semaphore::new(window_capacity as usize),
                window_capacity,
                consumed: Mutex::new(0),
                guard: Mutex::new(guard),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// Name of the rpc this stream was opened for.
    pub fn rpc(&self) -> &str {
        &self.inner.rpc
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    /// Cancellation context of the stream.
    ///
    /// Canceled when the stream is closed, when the peer sends `Close` or
    /// `Error`, when the caller's context is canceled or when the connection
    /// is torn down.
    pub fn context(&self) -> CancellationToken {
        self.inner.ctx.clone()
    }

    /// Send one message to the peer.
    pub async fn msg_send(&self, msg: &dyn Message) -> Result<()> {
        let _gate = self
            .inner
            .send_gate
            .try_lock()
            .map_err(|_| Error::protocol("concurrent msg_send on stream"))?;
        self.check_send()?;
        let encoded = Bytes::from(msg.marshal()?);
        self.send_encoded(encoded).await
    }

    /// Receive the next message into `msg`.
    ///
    /// Returns `Error::EndOfStream` once the peer closed its send side and
    /// every message was delivered, or the termination cause.
    pub async fn msg_recv(&self, msg: &mut dyn Message) -> Result<()> {
        let mut rx = self
            .inner
            .receiver
            .try_lock()
            .map_err(|_| Error::protocol("concurrent msg_recv on stream"))?;
        let next = tokio::select! {
            biased;
            _ = self.inner.abort.cancelled() => return Err(self.cause_or(Error::canceled("stream closed"))),
            next = rx.recv() => next,
        };
        match next {
            Some(buf) => {
                self.consume_window();
                msg.reset();
                msg.unmarshal(&buf)
            }
            None => Err(self.cause_or(Error::EndOfStream)),
        }
    }

    /// Tell the peer no more messages will be sent. Receiving is unaffected.
    pub fn close_send(&self) -> Result<()> {
        let next = {
            let mut state = self.inner.state.lock();
            match *state {
                StreamState::Idle => return Err(Error::protocol("stream not open")),
                StreamState::HalfClosedLocal | StreamState::Closed => return Ok(()),
                StreamState::Canceled => None,
                StreamState::Open | StreamState::HalfClosedRemote => {
                    *state = state.on_local_close_send();
                    Some(*state)
                }
            }
        };
        let Some(next) = next else {
            return Err(self.cause_or(Error::canceled("stream canceled")));
        };
        self.inner
            .conn
            .outbox
            .push(Frame::control(self.id(), FrameKind::CloseSend), None)?;
        if next == StreamState::Closed {
            self.inner.conn.forget(self.id());
        }
        Ok(())
    }

    /// Close the stream in both directions and cancel its context.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        let prior = {
            let mut state = self.inner.state.lock();
            let prior = *state;
            *state = state.on_close();
            prior
        };
        self.set_cause(Error::canceled("stream closed"));
        self.inner.inbound.lock().take();
        self.inner.abort.cancel();
        self.inner.conn.forget(self.id());
        self.release_guard();
        if peer_knows(prior) {
            // The connection may already be gone; that is not this stream's failure.
            let _ = self
                .inner
                .conn
                .outbox
                .push(Frame::control(self.id(), FrameKind::Close), None);
        }
        Ok(())
    }

    /// Terminate the stream with `err`, reporting it to the peer.
    pub fn send_error(&self, err: &Error) -> Result<()> {
        let prior = self.transition_cancel();
        if prior.is_terminal() {
            return Err(self.cause_or(Error::canceled("stream closed")));
        }
        self.set_cause(err.clone());
        self.inner.inbound.lock().take();
        self.inner.abort.cancel();
        self.inner.conn.forget(self.id());
        self.release_guard();
        if prior == StreamState::Idle {
            return Ok(());
        }
        self.inner
            .conn
            .outbox
            .push(Frame::error(self.id(), err), None)
    }

    // =========================================================================
    // Connection-side operations
    // =========================================================================

    /// Send the `Invoke` frame, inlining `message` when it fits in the frame.
    pub(crate) async fn send_invoke(&self, message: Option<Bytes>) -> Result<()> {
        let config = self.inner.conn.config();
        let max_payload = config.max_frame_payload as usize;
        let overhead = InvokePayload::overhead(&self.inner.rpc);
        if overhead > max_payload {
            return Err(Error::protocol(format!(
                "rpc name too long: {}",
                self.inner.rpc
            )));
        }
        if let Some(msg) = &message {
            if msg.len() > config.max_message_bytes {
                return Err(Error::protocol(format!(
                    "message exceeds {} bytes",
                    config.max_message_bytes
                )));
            }
        }
        let inline = matches!(&message, Some(msg) if overhead + msg.len() <= max_payload);

        {
            let mut state = self.inner.state.lock();
            *state = state.on_open();
        }
        if inline {
            self.acquire_window().await?;
        }
        let payload = InvokePayload::encode(
            &self.inner.rpc,
            if inline { message.as_deref() } else { None },
        )?;
        self.inner
            .conn
            .outbox
            .push(Frame::new(self.id(), FrameKind::Invoke, payload), None)?;

        match message {
            Some(msg) if !inline => self.send_encoded(msg).await,
            _ => Ok(()),
        }
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.inner.state.lock();
        *state = state.on_open();
    }

    /// Feed a data frame into reassembly.
    pub(crate) fn on_data(&self, kind: FrameKind, payload: &[u8]) -> Result<Option<Bytes>> {
        if !self.state().can_recv() {
            return Err(Error::protocol(format!(
                "data on stream {} after close send",
                self.id()
            )));
        }
        self.inner.reassembly.lock().push(kind, payload)
    }

    /// Queue a complete message for `msg_recv`. Never waits: a full queue
    /// means the peer overran its window.
    pub(crate) fn deliver(&self, message: Bytes) -> Result<()> {
        let tx = self.inner.inbound.lock().clone();
        let Some(tx) = tx else {
            return Ok(());
        };
        match tx.try_send(message) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::protocol(format!(
                "stream {} exceeded its receive window of {} messages",
                self.id(),
                self.inner.window_capacity
            ))),
        }
    }

    /// The peer consumed `messages` of ours.
    pub(crate) fn on_window_update(&self, messages: u32) {
        let grant = messages.min(self.inner.window_capacity) as usize;
        let room = (self.inner.window_capacity as usize)
            .saturating_sub(self.inner.window.available_permits());
        self.inner.window.add_permits(grant.min(room));
    }

    pub(crate) fn on_remote_close_send(&self) {
        let next = {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = state.on_remote_close_send();
            *state
        };
        self.inner.inbound.lock().take();
        if next == StreamState::Closed {
            self.inner.conn.forget(self.id());
        }
    }

    pub(crate) fn on_remote_close(&self) {
        {
            let mut state = self.inner.state.lock();
            *state = state.on_close();
        }
        self.inner.inbound.lock().take();
        self.inner.ctx.cancel();
        self.inner.conn.forget(self.id());
    }

    /// The peer terminated the stream with `err`. Queued messages are still
    /// delivered before `err` is reported.
    pub(crate) fn on_remote_error(&self, err: Error) {
        let _ = self.transition_cancel();
        self.set_cause(err);
        self.inner.inbound.lock().take();
        self.inner.ctx.cancel();
        self.inner.conn.forget(self.id());
    }

    /// Terminate locally with `cause`; optionally tell the peer with `Close`.
    pub(crate) fn terminate(&self, cause: Error, notify_peer: bool) {
        let prior = self.transition_cancel();
        self.set_cause(cause);
        self.inner.inbound.lock().take();
        self.inner.abort.cancel();
        self.inner.conn.forget(self.id());
        if notify_peer && peer_knows(prior) {
            let _ = self
                .inner
                .conn
                .outbox
                .push(Frame::control(self.id(), FrameKind::Close), None);
        }
    }

    pub(crate) fn release_guard(&self) {
        self.inner.guard.lock().take();
    }

    pub(crate) fn abort_token(&self) -> CancellationToken {
        self.inner.abort.clone()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn send_encoded(&self, message: Bytes) -> Result<()> {
        let config = self.inner.conn.config();
        if message.len() > config.max_message_bytes {
            return Err(Error::protocol(format!(
                "message exceeds {} bytes",
                config.max_message_bytes
            )));
        }
        self.acquire_window().await?;
        let frames = chunk_message(self.id(), message, config.max_frame_payload as usize);
        for frame in frames {
            let credit = tokio::select! {
                biased;
                _ = self.inner.ctx.cancelled() => return Err(self.send_failure()),
                credit = self.inner.credits.clone().acquire_owned() => {
                    credit.map_err(|_| Error::internal("send credits closed"))?
                }
            };
            self.check_send()?;
            self.inner.conn.outbox.push(frame, Some(credit))?;
        }
        Ok(())
    }

    async fn acquire_window(&self) -> Result<()> {
        let permit = tokio::select! {
            biased;
            _ = self.inner.ctx.cancelled() => return Err(self.send_failure()),
            permit = self.inner.window.acquire() => {
                permit.map_err(|_| Error::internal("send window closed"))?
            }
        };
        // Returned by the peer's WindowUpdate, not by dropping.
        permit.forget();
        Ok(())
    }

    /// Count one consumed message; grant window back in batches of half
    /// the capacity.
    fn consume_window(&self) {
        let threshold = (self.inner.window_capacity / 2).max(1);
        let grant = {
            let mut consumed = self.inner.consumed.lock();
            *consumed += 1;
            if *consumed < threshold {
                return;
            }
            std::mem::take(&mut *consumed)
        };
        if !self.state().can_recv() {
            return;
        }
        // Nothing to grant on a connection that is gone.
        let _ = self
            .inner
            .conn
            .outbox
            .push(Frame::window_update(self.id(), grant), None);
    }

    fn check_send(&self) -> Result<()> {
        if self.state().can_send() {
            Ok(())
        } else {
            Err(self.send_failure())
        }
    }

    fn send_failure(&self) -> Error {
        match self.state() {
            StreamState::Idle => Error::protocol("stream not open"),
            StreamState::HalfClosedLocal => Error::protocol("send side already closed"),
            _ => self.cause_or(Error::canceled("stream closed")),
        }
    }

    /// Move to `Canceled`; returns the prior state.
    fn transition_cancel(&self) -> StreamState {
        let mut state = self.inner.state.lock();
        let prior = *state;
        *state = state.on_cancel();
        prior
    }

    fn set_cause(&self, err: Error) {
        let mut cause = self.inner.cause.lock();
        if cause.is_none() {
            *cause = Some(err);
        }
    }

    fn cause_or(&self, fallback: Error) -> Error {
        self.inner.cause.lock().clone().unwrap_or(fallback)
    }
}

/// Whether the peer has seen the stream and is owed a `Close`.
fn peer_knows(state: StreamState) -> bool {
    !state.is_terminal() && state != StreamState::Idle
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("rpc", &self.inner.rpc)
            .field("state", &self.state())
            .finish()
    }
}
