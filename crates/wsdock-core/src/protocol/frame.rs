//! WebSocket frame decoding and serialization on top of tungstenite's frame
//! types.
//!
//! Wire format (RFC 6455 §5.2):
//! ```text
//!  0               1               2               3
//! [F|R|R|R| op  ][M| len7     ][ext len: 0, 2 or 8 bytes][mask: 0 or 4][payload]
//!  I S S S  (4)   A   (7)
//!  N V V V        S
//!    1 2 3        K
//! ```
//!
//! [`FrameHeader::parse`] reads the header; this module adds the checks a
//! server must make before it buffers a payload (size limit, control-frame
//! rules, reserved bits) and unmasks what the client sent.
//!
//! # Masking (for beginners)
//!
//! Every frame a browser sends to a server is *masked*: the payload bytes are
//! XOR-ed with a 4-byte key carried in the header.  The server must undo this
//! before it can read the payload.  Frames the server sends back are not
//! masked.  [`decode_frame`] unmasks and clears the key, so a decoded frame
//! always holds the plain application bytes.

use std::io::Cursor;

use thiserror::Error;
use tungstenite::error::{Error as WsError, ProtocolError};

pub use tungstenite::protocol::frame::coding::{Control, Data, OpCode};
pub use tungstenite::protocol::frame::{Frame, FrameHeader};

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Errors that can occur while decoding a frame from raw bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not yet hold a complete frame.  Read more bytes and retry.
    #[error("insufficient data: {available} bytes buffered, frame incomplete")]
    InsufficientData { available: usize },

    /// One of RSV1..RSV3 is set, but no extension was negotiated.
    #[error("reserved bits set without a negotiated extension: 0b{0:03b}")]
    ReservedBitsSet(u8),

    /// The opcode is one RFC 6455 reserves (0x3–0x7, 0xB–0xF).
    #[error("reserved opcode 0x{0:X}")]
    InvalidOpcode(u8),

    /// The declared payload length exceeds the configured maximum frame size.
    #[error("frame payload of {size} bytes exceeds the maximum of {max}")]
    FrameTooLarge { size: u64, max: usize },

    /// A control frame declared a payload longer than 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    /// A control frame arrived with the FIN bit cleared.
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    /// The most significant bit of a 64-bit payload length was set.
    #[error("invalid 64-bit payload length")]
    InvalidLength,

    /// The header could not be read for any other reason.
    #[error("malformed frame header: {0}")]
    Malformed(String),
}

/// Builders for the frames this crate produces and its tests feed in.
///
/// tungstenite's own constructors cover ping, pong and close; this adds the
/// data frames and the fragment/mask toggles.
pub trait FrameExt: Sized {
    /// A final text frame.
    fn text(text: &str) -> Self;
    /// A final binary frame.
    fn binary(data: Vec<u8>) -> Self;
    /// A final continuation frame.
    fn continuation(data: Vec<u8>) -> Self;
    /// Clears FIN, marking the frame as a non-final fragment.
    fn non_final(self) -> Self;
    /// Sets the key applied by [`encode_frame`].
    fn masked(self, key: [u8; 4]) -> Self;
    fn opcode(&self) -> OpCode;
}

impl FrameExt for Frame {
    fn text(text: &str) -> Self {
        Frame::message(text.as_bytes().to_vec(), OpCode::Data(Data::Text), true)
    }

    fn binary(data: Vec<u8>) -> Self {
        Frame::message(data, OpCode::Data(Data::Binary), true)
    }

    fn continuation(data: Vec<u8>) -> Self {
        Frame::message(data, OpCode::Data(Data::Continue), true)
    }

    fn non_final(mut self) -> Self {
        self.header_mut().is_final = false;
        self
    }

    fn masked(mut self, key: [u8; 4]) -> Self {
        self.header_mut().mask = Some(key);
        self
    }

    fn opcode(&self) -> OpCode {
        self.header().opcode
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// XORs `data` in place with the 4-byte `key`.
///
/// Masking is its own inverse: applying the same key twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Serializes `frame` to wire bytes, choosing the shortest length encoding.
///
/// A frame whose header carries a mask key is masked on the way out.
pub fn encode_frame(frame: Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame.len());
    // Writing into a Vec cannot fail.
    let _ = frame.format(&mut buf);
    buf
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame (payload unmasked, mask key cleared) and the number of
/// bytes consumed so the caller can advance its read buffer.  `max_payload`
/// bounds the declared payload length; anything larger is rejected before it
/// is buffered.
///
/// # Errors
///
/// [`FrameError::InsufficientData`] means "wait for more bytes"; every other
/// variant is a protocol violation.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
    let mut cursor = Cursor::new(bytes);
    let (mut header, declared_len) = match FrameHeader::parse(&mut cursor) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => {
            return Err(FrameError::InsufficientData {
                available: bytes.len(),
            })
        }
        Err(WsError::Protocol(ProtocolError::InvalidOpcode(bits))) => {
            return Err(FrameError::InvalidOpcode(bits))
        }
        Err(e) => return Err(FrameError::Malformed(e.to_string())),
    };

    let rsv = (u8::from(header.rsv1) << 2) | (u8::from(header.rsv2) << 1) | u8::from(header.rsv3);
    if rsv != 0 {
        return Err(FrameError::ReservedBitsSet(rsv));
    }
    if declared_len & (1 << 63) != 0 {
        return Err(FrameError::InvalidLength);
    }
    if let OpCode::Control(_) = header.opcode {
        if !header.is_final {
            return Err(FrameError::FragmentedControlFrame);
        }
        if declared_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge(declared_len));
        }
    }
    if declared_len > max_payload as u64 {
        return Err(FrameError::FrameTooLarge {
            size: declared_len,
            max: max_payload,
        });
    }

    let offset = cursor.position() as usize;
    // Safe: declared_len <= max_payload, which is a usize.
    let total = offset + declared_len as usize;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            available: bytes.len(),
        });
    }

    let mut payload = bytes[offset..total].to_vec();
    if let Some(key) = header.mask.take() {
        apply_mask(&mut payload, key);
    }
    Ok((Frame::from_payload(header, payload), total))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
