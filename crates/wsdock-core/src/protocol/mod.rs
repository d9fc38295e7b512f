//! WebSocket protocol layers: wire frames, close codes, fragment aggregation,
//! the per-connection session state machine and the HTTP upgrade handshake.

pub mod aggregator;
pub mod close;
pub mod frame;
pub mod handshake;
pub mod session;

pub use aggregator::{AggregateError, AggregatorLimits, FrameAggregator};
pub use close::{close_frame, decode_close_code, encode_close_payload, CloseCode, CloseFrame};
pub use frame::{
    apply_mask, decode_frame, encode_frame, Control, Data, Frame, FrameError, FrameExt, FrameHeader,
    OpCode,
};
pub use handshake::{
    accept_key, classify_upgrade, parse_request_head, HandshakeError, RequestHead, UpgradeRequest,
};
pub use session::{CloseReason, FrameSession, Message, SessionAction};
