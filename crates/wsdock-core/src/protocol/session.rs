//! Per-connection WebSocket session state machine.
//!
//! [`FrameSession`] owns everything one upgraded connection needs to turn raw
//! socket bytes into application messages: the receive buffer, the frame
//! decoder, the fragment aggregator and the close-handshake flag.  It performs
//! no I/O.  The caller appends bytes with [`FrameSession::receive`], then
//! drains [`FrameSession::next_action`] until it returns `None`, executing
//! each action (deliver a message, write a reply, close the socket).
//!
//! # Close handshake (for beginners)
//!
//! Either side may start closing by sending a close frame.  The other side
//! answers with its own close frame and both drop the TCP connection.
//!
//! ```text
//!   peer starts:    peer ──Close(1000)──▶ us      us ──Close(1000)──▶ peer   then close
//!   we start:       us ──Close(1001)──▶ peer      (awaiting_close = true)
//!                   peer ──Close(1001)──▶ us      close immediately, nothing written
//! ```
//!
//! Once a close frame has gone out, no further text or binary frames may be
//! written; [`FrameSession::encode_message`] refuses them.

use tracing::{debug, trace};

use crate::protocol::aggregator::{AggregateError, AggregatorLimits, FrameAggregator};
use crate::protocol::close::{close_frame, decode_close_code, CloseCode};
use crate::protocol::frame::{
    decode_frame, encode_frame, Control, Data, Frame, FrameError, FrameExt, FrameHeader, OpCode,
};

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer started the close handshake, optionally with a status code.
    PeerClosed(Option<CloseCode>),
    /// The peer answered a close frame we sent earlier.
    Acknowledged,
    /// The peer broke the protocol; we sent a close frame with this code.
    Violation(CloseCode),
}

/// Work the caller must perform after a frame was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Hand a complete message to the application.
    Deliver(Message),
    /// Write these bytes (a pong) and keep reading.
    Reply(Vec<u8>),
    /// Write `reply` if present, then shut the connection down.
    Close {
        reply: Option<Vec<u8>>,
        reason: CloseReason,
    },
}

/// Sans-I/O state for one upgraded connection.
#[derive(Debug)]
pub struct FrameSession {
    recv_buf: Vec<u8>,
    aggregator: FrameAggregator,
    max_frame_size: usize,
    awaiting_close: bool,
    finished: bool,
}

impl FrameSession {
    /// Creates a session whose frames and reassembled messages are bounded by
    /// `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self::with_limits(max_frame_size, AggregatorLimits::with_max_size(max_frame_size))
    }

    pub fn with_limits(max_frame_size: usize, limits: AggregatorLimits) -> Self {
        Self {
            recv_buf: Vec::new(),
            aggregator: FrameAggregator::new(limits),
            max_frame_size,
            awaiting_close: false,
            finished: false,
        }
    }

    /// `true` once a close frame has been sent from this side.
    pub fn is_awaiting_close(&self) -> bool {
        self.awaiting_close
    }

    /// `true` once a [`SessionAction::Close`] has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of received bytes not yet decoded into a frame.
    pub fn buffered_len(&self) -> usize {
        self.recv_buf.len()
    }

    /// Appends bytes read from the socket.
    pub fn receive(&mut self, bytes: &[u8]) {
        self.recv_buf.extend_from_slice(bytes);
    }

    /// Decodes buffered bytes until an action is produced.
    ///
    /// Returns `None` when more bytes are needed or the session has finished.
    /// Pongs and other frames needing no reaction are consumed silently.
    pub fn next_action(&mut self) -> Option<SessionAction> {
        while !self.finished {
            let frame = match decode_frame(&self.recv_buf, self.max_frame_size) {
                Ok((frame, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    frame
                }
                Err(FrameError::InsufficientData { .. }) => return None,
                Err(e) => {
                    debug!("frame decode error: {e}");
                    let code = match e {
                        FrameError::FrameTooLarge { .. } => CloseCode::Size,
                        _ => CloseCode::Protocol,
                    };
                    return Some(self.violation(code));
                }
            };

            let frame = match self.aggregator.push(frame) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    debug!("fragment aggregation error: {e}");
                    let code = match e {
                        AggregateError::MessageTooLarge { .. } => CloseCode::Size,
                        _ => CloseCode::Protocol,
                    };
                    return Some(self.violation(code));
                }
            };

            if let Some(action) = self.handle_frame(frame) {
                return Some(action);
            }
        }
        None
    }

    /// Dispatches one complete frame by opcode.
    pub fn handle_frame(&mut self, frame: Frame) -> Option<SessionAction> {
        if self.finished {
            return None;
        }
        let opcode = frame.opcode();
        trace!(%opcode, len = frame.payload().len(), "frame received");

        match opcode {
            OpCode::Data(Data::Text) => match frame.into_string() {
                Ok(text) => Some(SessionAction::Deliver(Message::Text(text))),
                Err(_) => Some(self.violation(CloseCode::Invalid)),
            },
            OpCode::Data(Data::Binary) => {
                Some(SessionAction::Deliver(Message::Binary(frame.into_data())))
            }
            OpCode::Control(Control::Ping) => {
                if self.awaiting_close {
                    return None;
                }
                Some(SessionAction::Reply(encode_frame(Frame::pong(frame.into_data()))))
            }
            OpCode::Control(Control::Pong) | OpCode::Data(Data::Continue) => None,
            OpCode::Control(Control::Close) => {
                self.finished = true;
                if self.awaiting_close {
                    return Some(SessionAction::Close {
                        reply: None,
                        reason: CloseReason::Acknowledged,
                    });
                }
                self.awaiting_close = true;
                let payload = frame.into_data();
                let peer_code = decode_close_code(&payload);
                let echoed = match payload.get(..2) {
                    Some(code_bytes) => code_bytes.to_vec(),
                    None => u16::from(CloseCode::Normal).to_be_bytes().to_vec(),
                };
                // The default header is a final, unmasked close frame.
                let reply = Frame::from_payload(FrameHeader::default(), echoed);
                Some(SessionAction::Close {
                    reply: Some(encode_frame(reply)),
                    reason: CloseReason::PeerClosed(peer_code),
                })
            }
            OpCode::Data(Data::Reserved(bits)) | OpCode::Control(Control::Reserved(bits)) => {
                debug!("unknown opcode 0x{bits:X}");
                Some(self.violation(CloseCode::Protocol))
            }
        }
    }

    /// Encodes an outbound message, or `None` once a close frame has been sent.
    pub fn encode_message(&self, message: &Message) -> Option<Vec<u8>> {
        if self.awaiting_close {
            return None;
        }
        let frame = match message {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data.clone()),
        };
        Some(encode_frame(frame))
    }

    /// Starts a server-side close handshake.
    ///
    /// Returns the close frame to write, or `None` if one was already sent.
    pub fn initiate_close(&mut self, code: CloseCode, reason: &str) -> Option<Vec<u8>> {
        if self.awaiting_close {
            return None;
        }
        self.awaiting_close = true;
        Some(encode_frame(Frame::close(Some(close_frame(code, reason)))))
    }

    fn violation(&mut self, code: CloseCode) -> SessionAction {
        self.finished = true;
        let reply = self.initiate_close(code, "");
        SessionAction::Close {
            reply,
            reason: CloseReason::Violation(code),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];
    const MAX: usize = 1024;

    /// Encodes `frame` the way a browser would send it.
    fn client_bytes(frame: Frame) -> Vec<u8> {
        encode_frame(frame.masked(KEY))
    }

    fn session_with(frames: Vec<Frame>) -> FrameSession {
        let mut session = FrameSession::new(MAX);
        for frame in frames {
            session.receive(&client_bytes(frame));
        }
        session
    }

    fn reserved_frame(bits: u8) -> Frame {
        let header = FrameHeader {
            opcode: OpCode::Data(Data::Reserved(bits)),
            ..FrameHeader::default()
        };
        Frame::from_payload(header, vec![1])
    }

    fn decode_reply(bytes: &[u8]) -> Frame {
        decode_frame(bytes, MAX).unwrap().0
    }

    #[test]
    fn test_text_frame_delivered() {
        let mut session = session_with(vec![Frame::text("héllo")]);
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Deliver(Message::Text("héllo".to_string())))
        );
        assert_eq!(session.next_action(), None);
    }

    #[test]
    fn test_empty_text_frame_delivered() {
        let mut session = session_with(vec![Frame::text("")]);
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Deliver(Message::Text(String::new())))
        );
    }

    #[test]
    fn test_binary_frame_delivered() {
        let mut session = session_with(vec![Frame::binary(vec![0, 255, 7])]);
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Deliver(Message::Binary(vec![0, 255, 7])))
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let bytes = client_bytes(Frame::text("split"));
        let mut session = FrameSession::new(MAX);

        session.receive(&bytes[..3]);
        assert_eq!(session.next_action(), None);
        assert_eq!(session.buffered_len(), 3);

        session.receive(&bytes[3..]);
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Deliver(Message::Text("split".to_string())))
        );
        assert_eq!(session.buffered_len(), 0);
    }

    #[test]
    fn test_ping_answered_with_pong_carrying_same_payload() {
        let mut session = session_with(vec![Frame::ping(b"beat".to_vec())]);
        let Some(SessionAction::Reply(bytes)) = session.next_action() else {
            panic!("expected a pong reply");
        };
        let pong = decode_reply(&bytes);
        assert_eq!(pong.opcode(), OpCode::Control(Control::Pong));
        assert_eq!(pong.payload(), b"beat");
    }

    #[test]
    fn test_pong_ignored() {
        let mut session = session_with(vec![Frame::pong(vec![1]), Frame::text("after")]);
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Deliver(Message::Text("after".to_string())))
        );
    }

    #[test]
    fn test_fragmented_message_delivered_once() {
        let mut session = session_with(vec![
            Frame::text("ab").non_final(),
            Frame::continuation(b"cd".to_vec()),
        ]);
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Deliver(Message::Text("abcd".to_string())))
        );
        assert_eq!(session.next_action(), None);
    }

    #[test]
    fn test_peer_close_with_code_is_echoed() {
        let mut session = session_with(vec![Frame::close(Some(close_frame(CloseCode::Away, "bye")))]);

        let Some(SessionAction::Close { reply, reason }) = session.next_action() else {
            panic!("expected close");
        };
        assert_eq!(reason, CloseReason::PeerClosed(Some(CloseCode::Away)));
        let echoed = decode_reply(&reply.unwrap());
        assert_eq!(echoed.opcode(), OpCode::Control(Control::Close));
        assert_eq!(echoed.payload(), &vec![0x03, 0xE9]);
        assert!(session.is_awaiting_close());
        assert!(session.is_finished());
    }

    #[test]
    fn test_peer_close_without_code_gets_normal_closure() {
        let mut session = session_with(vec![Frame::close(None)]);
        let Some(SessionAction::Close { reply, reason }) = session.next_action() else {
            panic!("expected close");
        };
        assert_eq!(reason, CloseReason::PeerClosed(None));
        assert_eq!(decode_reply(&reply.unwrap()).payload(), &vec![0x03, 0xE8]);
    }

    #[test]
    fn test_close_after_our_close_writes_nothing() {
        let mut session = FrameSession::new(MAX);
        assert!(session.initiate_close(CloseCode::Away, "").is_some());

        session.receive(&client_bytes(Frame::close(Some(close_frame(CloseCode::Away, "")))));
        assert_eq!(
            session.next_action(),
            Some(SessionAction::Close {
                reply: None,
                reason: CloseReason::Acknowledged
            })
        );
    }

    #[test]
    fn test_unknown_opcode_is_protocol_violation() {
        let mut session = session_with(vec![reserved_frame(0x3)]);
        let Some(SessionAction::Close { reply, reason }) = session.next_action() else {
            panic!("expected close");
        };
        assert_eq!(reason, CloseReason::Violation(CloseCode::Protocol));
        assert_eq!(decode_reply(&reply.unwrap()).payload(), &vec![0x03, 0xEA]);
        assert!(session.is_awaiting_close());
    }

    #[test]
    fn test_invalid_utf8_text_closes_with_invalid_payload() {
        let mut session = session_with(vec![Frame::message(vec![0xFF, 0xFE], OpCode::Data(Data::Text), true)]);
        assert!(matches!(
            session.next_action(),
            Some(SessionAction::Close {
                reason: CloseReason::Violation(CloseCode::Invalid),
                ..
            })
        ));
    }

    #[test]
    fn test_oversized_frame_closes_with_too_big() {
        let mut session = session_with(vec![Frame::binary(vec![0; MAX + 1])]);
        assert!(matches!(
            session.next_action(),
            Some(SessionAction::Close {
                reason: CloseReason::Violation(CloseCode::Size),
                ..
            })
        ));
    }

    #[test]
    fn test_nothing_processed_after_finish() {
        let mut session = session_with(vec![Frame::close(None), Frame::text("late")]);
        assert!(matches!(
            session.next_action(),
            Some(SessionAction::Close { .. })
        ));
        assert_eq!(session.next_action(), None);
    }

    #[test]
    fn test_outbound_refused_once_awaiting_close() {
        let mut session = FrameSession::new(MAX);
        let msg = Message::Text("hi".to_string());
        assert_eq!(
            session.encode_message(&msg),
            Some(encode_frame(Frame::text("hi")))
        );

        session.initiate_close(CloseCode::Normal, "");
        assert_eq!(session.encode_message(&msg), None);
        assert_eq!(session.initiate_close(CloseCode::Normal, ""), None);
    }
}
