//! Close-frame status codes and payloads (RFC 6455 §7.4).
//!
//! A close frame payload is either empty or a 2-byte big-endian status code
//! optionally followed by a UTF-8 reason.  The code table itself is
//! tungstenite's [`CloseCode`].

use std::borrow::Cow;

use tungstenite::protocol::frame::Frame;

pub use tungstenite::protocol::frame::coding::CloseCode;
pub use tungstenite::protocol::frame::CloseFrame;

use super::frame::MAX_CONTROL_PAYLOAD;

/// Builds a close frame body for `code` and `reason`.
///
/// `reason` is truncated on a character boundary so the payload never exceeds
/// the 125-byte control frame limit.
pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame<'static> {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: Cow::Owned(reason[..end].to_string()),
    }
}

/// The raw payload of a close frame: status code followed by `reason`.
pub fn encode_close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    Frame::close(Some(close_frame(code, reason))).into_data()
}

/// Reads the status code from a close payload.
///
/// Returns `None` for an empty payload or a single stray byte; the reason
/// text, if any, is ignored.
pub fn decode_close_code(payload: &[u8]) -> Option<CloseCode> {
    match payload {
        [hi, lo, ..] => Some(CloseCode::from(u16::from_be_bytes([*hi, *lo]))),
        _ => None,
    }
}
