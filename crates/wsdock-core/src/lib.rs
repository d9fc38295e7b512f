//! # wsdock-core
//!
//! Sans-I/O WebSocket protocol library for wsdock: frame codec, fragment
//! aggregation, close handshake and the HTTP/1.1 upgrade handshake.
//!
//! Nothing in this crate touches a socket, a clock or a thread.  Every
//! function takes bytes (or typed frames) and returns bytes (or typed
//! actions), which keeps the protocol logic fully unit-testable.
//!
//! # Architecture overview (for beginners)
//!
//! A WebSocket connection starts life as an ordinary HTTP request and is then
//! "upgraded" into a stream of binary frames.  The layers, bottom up:
//!
//! - **`protocol::handshake`** – Parses the HTTP request head (with
//!   `httparse`), decides whether it asks for an upgrade, and formats the
//!   101/200/400/405 responses.
//!
//! - **`protocol::frame`** – Reads and writes individual frames using
//!   tungstenite's `Frame` and `FrameHeader`, adding the size limit, the
//!   control-frame rules and unmasking.
//!
//! - **`protocol::aggregator`** – Glues fragmented messages back together so
//!   higher layers only see whole messages.
//!
//! - **`protocol::session`** – The per-connection state machine: answers
//!   pings, runs the close handshake, rejects protocol violations and hands
//!   text/binary messages to the application.
//!
//! The `wsdock-server` crate drives these layers over TCP or TLS sockets.

pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `wsdock_core::FrameSession` instead of `wsdock_core::protocol::session::FrameSession`.
pub use protocol::close::{CloseCode, CloseFrame};
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameError, FrameExt, OpCode};
pub use protocol::handshake::{HandshakeError, RequestHead, UpgradeRequest};
pub use protocol::session::{CloseReason, FrameSession, Message, SessionAction};
