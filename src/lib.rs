//! # muxrpc - lightweight RPC over one multiplexed byte stream
//!
//! A single duplex transport (TCP, unix socket, in-memory pipe, TLS) carries
//! many independent request/response calls and bidirectional streams:
//! - Framer: length-prefixed frames tagged with a stream id and kind
//! - Stream engine: per-stream state machine, chunking and reassembly
//! - Connection multiplexer: one reader and one writer task per transport
//! - Dispatch table and server loop: rpc name → handler, one task per stream
//!
//! ## Architecture
//!
//! ```text
//!   client                                          server
//!   Conn::invoke / new_stream                       handler(Arc<S>, Stream)
//!        │                                                ▲
//!        ▼                                                │
//!   ┌─────────┐   frames    ┌───────────┐   frames   ┌─────────┐
//!   │ Stream  │ ──────────► │ transport │ ─────────► │ Stream  │
//!   └─────────┘ ◄────────── └───────────┘ ◄───────── └─────────┘
//! ```
//!
//! ```no_run
//! use muxrpc::{CancellationToken, Conn};
//! # #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
//! # struct Text { data: String }
//! # async fn run() -> muxrpc::Result<()> {
//! let transport = tokio::net::TcpStream::connect("127.0.0.1:7777").await?;
//! let conn = Conn::new(transport)?;
//! let mut out = Text::default();
//! conn.invoke(&CancellationToken::new(), "Echo", &Text { data: "hi".into() }, &mut out)
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod conn;
pub mod message;
pub mod server;
pub mod stream;
pub mod types;
pub mod wire;

// Internal utilities
pub mod observability;

pub use conn::{Conn, Transport};
pub use message::Message;
pub use server::{
    streaming, unary, Description, DispatchTable, Handler, HandlerFuture, Listener, Method,
    MethodToken, Server,
};
pub use stream::{Stream, StreamState};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    Config, ConnConfig, Error, ErrorClass, ObservabilityConfig, Result, ServerConfig,
};
