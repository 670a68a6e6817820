//! Wire protocol: typed frames over a raw duplex byte stream.
//!
//! This layer knows nothing about RPC semantics; it turns `Frame`s into bytes
//! and back. Chunking and reassembly of messages live here too since they are
//! pure functions of the frame layout.

pub mod codec;
pub mod frame;

pub use codec::{read_frame, write_frame};
pub use frame::{Frame, FrameKind, InvokePayload, Reassembler, HEADER_LEN};
