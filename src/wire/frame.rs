//! Frame types and payload layouts.
//!
//! `Invoke` payload:
//! ```text
//! ┌───────────────┬───────────────┬──────────┬──────────────────────┐
//! │ name len (2B) │ rpc name      │ flag(1B) │ first message        │
//! │ u16 BE        │ UTF-8         │ 0 | 1    │ present iff flag = 1 │
//! └───────────────┴───────────────┴──────────┴──────────────────────┘
//! ```
//!
//! `Error` payload: `[class code (1B)][UTF-8 message]`.
//!
//! `WindowUpdate` payload: `[u32 BE message count]`, returning receive window
//! to the sender after messages were consumed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Error, ErrorClass, Result, StreamId};

/// Size of the fixed frame header: kind + stream id + payload length.
pub const HEADER_LEN: usize = 9;

const INVOKE_NO_MESSAGE: u8 = 0;
const INVOKE_INLINE_MESSAGE: u8 = 1;

/// Frame kind tag, the first byte of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Opens a stream: rpc name, optionally the first message.
    Invoke = 0x01,
    /// A non-final chunk of a message.
    MessageData = 0x02,
    /// The final chunk of a message.
    MessageDataEnd = 0x03,
    /// The sender will send no more messages.
    CloseSend = 0x04,
    /// The sender is done with the stream in both directions.
    Close = 0x05,
    /// Terminates the stream with a classified error.
    Error = 0x06,
    /// The receiver consumed messages; the sender may send that many more.
    WindowUpdate = 0x07,
}

impl FrameKind {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(FrameKind::Invoke),
            0x02 => Some(FrameKind::MessageData),
            0x03 => Some(FrameKind::MessageDataEnd),
            0x04 => Some(FrameKind::CloseSend),
            0x05 => Some(FrameKind::Close),
            0x06 => Some(FrameKind::Error),
            0x07 => Some(FrameKind::WindowUpdate),
            _ => None,
        }
    }

    pub const fn is_data(self) -> bool {
        matches!(self, FrameKind::MessageData | FrameKind::MessageDataEnd)
    }
}

/// One unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: StreamId, kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            kind,
            payload: payload.into(),
        }
    }

    /// A frame with no payload (`CloseSend`, `Close`).
    pub fn control(stream_id: StreamId, kind: FrameKind) -> Self {
        Self::new(stream_id, kind, Bytes::new())
    }

    /// An `Error` frame carrying `err`'s class and message.
    pub fn error(stream_id: StreamId, err: &Error) -> Self {
        Self::new(stream_id, FrameKind::Error, encode_error(err))
    }

    /// A `WindowUpdate` frame granting `messages` more messages.
    pub fn window_update(stream_id: StreamId, messages: u32) -> Self {
        Self::new(
            stream_id,
            FrameKind::WindowUpdate,
            Bytes::copy_from_slice(&messages.to_be_bytes()),
        )
    }
}

/// Decoded `Invoke` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokePayload {
    pub rpc: String,
    pub message: Option<Bytes>,
}

impl InvokePayload {
    /// Bytes an `Invoke` frame needs for `rpc` before any inline message.
    pub fn overhead(rpc: &str) -> usize {
        2 + rpc.len() + 1
    }

    pub fn encode(rpc: &str, message: Option<&[u8]>) -> Result<Bytes> {
        let name_len = u16::try_from(rpc.len())
            .map_err(|_| Error::protocol(format!("rpc name too long: {} bytes", rpc.len())))?;
        let mut buf =
            BytesMut::with_capacity(Self::overhead(rpc) + message.map_or(0, |m| m.len()));
        buf.put_u16(name_len);
        buf.put_slice(rpc.as_bytes());
        match message {
            Some(msg) => {
                buf.put_u8(INVOKE_INLINE_MESSAGE);
                buf.put_slice(msg);
            }
            None => buf.put_u8(INVOKE_NO_MESSAGE),
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        if payload.len() < 3 {
            return Err(Error::protocol("invoke payload too short"));
        }
        let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let flag_at = 2 + name_len;
        if payload.len() <= flag_at {
            return Err(Error::protocol("invoke payload truncated"));
        }
        let rpc = std::str::from_utf8(&payload[2..flag_at])
            .map_err(|_| Error::protocol("rpc name is not valid UTF-8"))?
            .to_string();
        let message = match payload[flag_at] {
            INVOKE_NO_MESSAGE if payload.len() == flag_at + 1 => None,
            INVOKE_NO_MESSAGE => {
                return Err(Error::protocol("invoke payload has trailing bytes"));
            }
            INVOKE_INLINE_MESSAGE => Some(payload.slice(flag_at + 1..)),
            other => {
                return Err(Error::protocol(format!("bad invoke flag: 0x{:02X}", other)));
            }
        };
        Ok(Self { rpc, message })
    }
}

pub fn encode_error(err: &Error) -> Bytes {
    let message = err.wire_message();
    let mut buf = BytesMut::with_capacity(1 + message.len());
    buf.put_u8(err.class().code());
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Decode an `Error` payload into the remote error it describes.
pub fn decode_error(payload: &[u8]) -> Result<Error> {
    let (&code, message) = payload
        .split_first()
        .ok_or_else(|| Error::protocol("empty error payload"))?;
    let class = ErrorClass::from_code(code)
        .ok_or_else(|| Error::protocol(format!("unknown error class: {}", code)))?;
    Ok(Error::remote(class, String::from_utf8_lossy(message)))
}

pub fn decode_window_update(payload: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = payload
        .try_into()
        .map_err(|_| Error::protocol(format!("window update of {} bytes", payload.len())))?;
    Ok(u32::from_be_bytes(raw))
}

/// Split one encoded message into data frames of at most `max_payload` bytes.
///
/// Every chunk but the last is `MessageData`; the last is `MessageDataEnd`.
/// An empty message is a single empty `MessageDataEnd`.
pub fn chunk_message(stream_id: StreamId, message: Bytes, max_payload: usize) -> Vec<Frame> {
    let max_payload = max_payload.max(1);
    if message.is_empty() {
        return vec![Frame::control(stream_id, FrameKind::MessageDataEnd)];
    }
    let count = message.len().div_ceil(max_payload);
    let mut frames = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < message.len() {
        let end = (offset + max_payload).min(message.len());
        let kind = if end == message.len() {
            FrameKind::MessageDataEnd
        } else {
            FrameKind::MessageData
        };
        frames.push(Frame::new(stream_id, kind, message.slice(offset..end)));
        offset = end;
    }
    frames
}

/// Per-stream reassembly of chunked messages.
#[derive(Debug)]
pub struct Reassembler {
    buf: BytesMut,
    limit: usize,
}

impl Reassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Feed one data frame payload. Returns the complete message when `kind`
    /// is `MessageDataEnd`.
    pub fn push(&mut self, kind: FrameKind, chunk: &[u8]) -> Result<Option<Bytes>> {
        if self.buf.len() + chunk.len() > self.limit {
            self.buf.clear();
            return Err(Error::protocol(format!(
                "message exceeds {} bytes",
                self.limit
            )));
        }
        self.buf.extend_from_slice(chunk);
        match kind {
            FrameKind::MessageDataEnd => Ok(Some(self.buf.split().freeze())),
            FrameKind::MessageData => Ok(None),
            other => Err(Error::internal(format!("{:?} is not a data frame", other))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ID: StreamId = StreamId::new(7);

    #[test]
    fn invoke_payload_with_inline_message() {
        let encoded = InvokePayload::encode("Echo", Some(b"{\"data\":\"hi\"}")).unwrap();
        assert_eq!(encoded.len(), InvokePayload::overhead("Echo") + 13);

        let decoded = InvokePayload::decode(encoded).unwrap();
        assert_eq!(decoded.rpc, "Echo");
        assert_eq!(decoded.message.as_deref(), Some(&b"{\"data\":\"hi\"}"[..]));
    }

    #[test]
    fn invoke_payload_without_message() {
        let encoded = InvokePayload::encode("Sum", None).unwrap();
        let decoded = InvokePayload::decode(encoded).unwrap();
        assert_eq!(decoded.rpc, "Sum");
        assert_eq!(decoded.message, None);
    }

    #[test]
    fn inline_empty_message_is_distinct_from_none() {
        let encoded = InvokePayload::encode("Ping", Some(b"")).unwrap();
        let decoded = InvokePayload::decode(encoded).unwrap();
        assert_eq!(decoded.message, Some(Bytes::new()));
    }

    #[test]
    fn malformed_invoke_payloads_are_protocol_errors() {
        let cases: [&[u8]; 4] = [
            b"\x00",
            b"\x00\x09Echo\x00",
            b"\x00\x04Echo\x07",
            b"\x00\x04Echo\x00extra",
        ];
        for case in cases {
            let err = InvokePayload::decode(Bytes::copy_from_slice(case)).unwrap_err();
            assert!(err.is(ErrorClass::Protocol), "{:?}", case);
        }
    }

    #[test]
    fn error_payload_keeps_class() {
        let frame = Frame::error(ID, &Error::protocol("unknown rpc: Nope"));
        assert_eq!(frame.kind, FrameKind::Error);

        let err = decode_error(&frame.payload).unwrap();
        assert!(err.is(ErrorClass::Protocol));
        assert_eq!(err.wire_message(), "unknown rpc: Nope");
    }

    #[test]
    fn error_payload_with_unknown_class_is_rejected() {
        assert!(decode_error(b"\x09boom").is_err());
        assert!(decode_error(b"").is_err());
    }

    #[test]
    fn window_update_carries_count() {
        let frame = Frame::window_update(ID, 32);
        assert_eq!(FrameKind::from_u8(0x07), Some(FrameKind::WindowUpdate));
        assert_eq!(decode_window_update(&frame.payload).unwrap(), 32);
        assert!(decode_window_update(b"\x00\x01").unwrap_err().is(ErrorClass::Protocol));
    }

    #[test]
    fn chunking_marks_only_last_frame_as_end() {
        let frames = chunk_message(ID, Bytes::from_static(b"abcdefghij"), 4);
        let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FrameKind::MessageData,
                FrameKind::MessageData,
                FrameKind::MessageDataEnd
            ]
        );
        assert_eq!(&frames[2].payload[..], b"ij");
    }

    #[test]
    fn empty_message_is_one_end_frame() {
        let frames = chunk_message(ID, Bytes::new(), 4);
        assert_eq!(frames, vec![Frame::control(ID, FrameKind::MessageDataEnd)]);
    }

    #[test]
    fn reassembler_enforces_limit() {
        let mut re = Reassembler::new(8);
        assert_eq!(re.push(FrameKind::MessageData, b"12345").unwrap(), None);
        let err = re.push(FrameKind::MessageDataEnd, b"6789").unwrap_err();
        assert!(err.is(ErrorClass::Protocol));
        assert!(re.is_empty());
    }

    proptest! {
        #[test]
        fn chunks_reassemble_to_original(
            message in proptest::collection::vec(any::<u8>(), 0..2048),
            max_payload in 1usize..300,
        ) {
            let frames = chunk_message(ID, Bytes::from(message.clone()), max_payload);
            let mut re = Reassembler::new(4096);
            let mut out = None;
            for (i, frame) in frames.iter().enumerate() {
                prop_assert!(frame.payload.len() <= max_payload);
                let got = re.push(frame.kind, &frame.payload).unwrap();
                prop_assert_eq!(got.is_some(), i == frames.len() - 1);
                out = got;
            }
            prop_assert_eq!(out.map(|b| b.to_vec()), Some(message));
        }
    }
}
