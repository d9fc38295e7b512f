//! Fragment aggregation: turns a run of fragmented data frames into one
//! complete logical frame.
//!
//! # Fragmentation (for beginners)
//!
//! A peer may split one text or binary message across several frames.  The
//! first frame carries the real opcode with FIN cleared, the following ones
//! use the `Continuation` opcode, and the last one sets FIN:
//!
//! ```text
//! [Text, fin=0, "Hel"] [Continuation, fin=0, "lo, "] [Continuation, fin=1, "world"]
//!                                      ↓
//!                      [Text, fin=1, "Hello, world"]
//! ```
//!
//! Control frames (ping, pong, close) may be interleaved between fragments;
//! they are passed straight through without disturbing the buffered message.
//!
//! The aggregator sits between the frame decoder and the session state
//! machine, so the session only ever sees whole messages.

use thiserror::Error;

use crate::protocol::frame::{Data, Frame, OpCode};

/// Default cap on the number of fragments one message may be split into.
pub const DEFAULT_MAX_FRAGMENT_COUNT: usize = 1 << 16;

/// Errors raised while reassembling a fragmented message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    /// The reassembled message would exceed the configured maximum size.
    #[error("accumulated message of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// The message was split into more fragments than allowed.
    #[error("message split into more than {0} fragments")]
    TooManyFragments(usize),

    /// A non-final fragment carried fewer bytes than the configured minimum.
    #[error("non-final fragment of {size} bytes is below the minimum of {min}")]
    FragmentTooSmall { size: usize, min: usize },

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("continuation frame without a preceding fragment")]
    UnexpectedContinuation,

    /// A new text/binary frame arrived while a fragmented message was in progress.
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedDataFrame,
}

/// Limits applied while buffering fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorLimits {
    /// Smallest payload a non-final fragment may carry.
    pub min_non_final_fragment_size: usize,
    /// Largest number of fragments per message.
    pub max_accumulated_count: usize,
    /// Largest total payload per message, in bytes.
    pub max_accumulated_size: usize,
}

impl AggregatorLimits {
    /// Limits bounded by `max_message_size` bytes, allowing up to 65536
    /// non-empty fragments.
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self {
            min_non_final_fragment_size: 1,
            max_accumulated_count: DEFAULT_MAX_FRAGMENT_COUNT,
            max_accumulated_size: max_message_size,
        }
    }
}

/// A message whose fragments are still arriving.
#[derive(Debug)]
struct Partial {
    opcode: Data,
    payload: Vec<u8>,
    fragments: usize,
}

/// Reassembles fragmented data frames.  One instance per connection.
#[derive(Debug)]
pub struct FrameAggregator {
    limits: AggregatorLimits,
    partial: Option<Partial>,
}

impl FrameAggregator {
    pub fn new(limits: AggregatorLimits) -> Self {
        Self {
            limits,
            partial: None,
        }
    }

    /// Returns `true` while a fragmented message is buffered.
    pub fn is_buffering(&self) -> bool {
        self.partial.is_some()
    }

    /// Feeds one decoded frame.
    ///
    /// Returns `Ok(Some(frame))` when a complete frame is ready (a control
    /// frame, an unfragmented data frame, or the final piece of a fragmented
    /// message), `Ok(None)` while fragments are still being buffered.
    ///
    /// # Errors
    ///
    /// Any [`AggregateError`] is a protocol violation; the buffered message is
    /// discarded.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, AggregateError> {
        let data = match frame.header().opcode {
            OpCode::Data(data @ (Data::Continue | Data::Text | Data::Binary)) => data,
            // Control frames and reserved opcodes go straight to the session.
            _ => return Ok(Some(frame)),
        };

        let result = self.push_data(data, frame);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn push_data(&mut self, opcode: Data, frame: Frame) -> Result<Option<Frame>, AggregateError> {
        let limits = self.limits;
        let is_final = frame.header().is_final;
        match (opcode, self.partial.as_mut()) {
            (Data::Continue, None) => Err(AggregateError::UnexpectedContinuation),

            (Data::Continue, Some(partial)) => {
                if !is_final {
                    check_fragment_size(&limits, frame.payload().len())?;
                }
                let size = partial.payload.len() + frame.payload().len();
                if size > limits.max_accumulated_size {
                    return Err(AggregateError::MessageTooLarge {
                        size,
                        max: limits.max_accumulated_size,
                    });
                }
                partial.fragments += 1;
                if partial.fragments > limits.max_accumulated_count {
                    return Err(AggregateError::TooManyFragments(
                        limits.max_accumulated_count,
                    ));
                }
                partial.payload.extend_from_slice(frame.payload());

                if !is_final {
                    return Ok(None);
                }
                // `partial` is Some in this arm.
                Ok(self
                    .partial
                    .take()
                    .map(|done| Frame::message(done.payload, OpCode::Data(done.opcode), true)))
            }

            (_, Some(_)) => Err(AggregateError::InterleavedDataFrame),

            (opcode, None) => {
                if is_final {
                    return Ok(Some(frame));
                }
                let payload = frame.into_data();
                check_fragment_size(&limits, payload.len())?;
                if payload.len() > limits.max_accumulated_size {
                    return Err(AggregateError::MessageTooLarge {
                        size: payload.len(),
                        max: limits.max_accumulated_size,
                    });
                }
                self.partial = Some(Partial {
                    opcode,
                    payload,
                    fragments: 1,
                });
                Ok(None)
            }
        }
    }
}

fn check_fragment_size(limits: &AggregatorLimits, size: usize) -> Result<(), AggregateError> {
    if size < limits.min_non_final_fragment_size {
        return Err(AggregateError::FragmentTooSmall {
            size,
            min: limits.min_non_final_fragment_size,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Control, FrameExt};

    fn continuation(data: &[u8]) -> Frame {
        Frame::continuation(data.to_vec())
    }

    fn aggregator() -> FrameAggregator {
        FrameAggregator::new(AggregatorLimits::with_max_size(64))
    }

    #[test]
    fn test_unfragmented_frame_passes_through() {
        let mut agg = aggregator();
        let out = agg.push(Frame::text("hi")).unwrap();
        assert_eq!(out, Some(Frame::text("hi")));
        assert!(!agg.is_buffering());
    }

    #[test]
    fn test_three_fragments_reassemble_into_one_text_frame() {
        let mut agg = aggregator();

        assert_eq!(agg.push(Frame::text("Hel").non_final()).unwrap(), None);
        assert_eq!(agg.push(continuation(b"lo, ").non_final()).unwrap(), None);
        let done = agg.push(continuation(b"world")).unwrap().unwrap();

        assert_eq!(done.opcode(), OpCode::Data(Data::Text));
        assert!(done.header().is_final);
        assert_eq!(done.payload(), b"Hello, world");
        assert!(!agg.is_buffering());
    }

    #[test]
    fn test_control_frame_interleaved_between_fragments() {
        let mut agg = aggregator();
        agg.push(Frame::binary(vec![1, 2]).non_final()).unwrap();

        let ping = agg.push(Frame::ping(b"x".to_vec())).unwrap();
        assert_eq!(ping.map(|f| f.opcode()), Some(OpCode::Control(Control::Ping)));
        assert!(agg.is_buffering());

        let done = agg.push(continuation(&[3])).unwrap().unwrap();
        assert_eq!(done.opcode(), OpCode::Data(Data::Binary));
        assert_eq!(done.payload(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_continuation_without_start_is_rejected() {
        let mut agg = aggregator();
        assert_eq!(
            agg.push(continuation(b"x")),
            Err(AggregateError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_new_data_frame_mid_message_is_rejected_and_buffer_dropped() {
        let mut agg = aggregator();
        agg.push(Frame::text("a").non_final()).unwrap();
        assert_eq!(
            agg.push(Frame::text("b")),
            Err(AggregateError::InterleavedDataFrame)
        );
        assert!(!agg.is_buffering());
    }

    #[test]
    fn test_accumulated_size_limit() {
        let mut agg = aggregator();
        agg.push(Frame::binary(vec![0; 40]).non_final()).unwrap();
        assert_eq!(
            agg.push(continuation(&[0; 30])),
            Err(AggregateError::MessageTooLarge { size: 70, max: 64 })
        );
    }

    #[test]
    fn test_fragment_count_limit() {
        let mut agg = FrameAggregator::new(AggregatorLimits {
            min_non_final_fragment_size: 1,
            max_accumulated_count: 2,
            max_accumulated_size: 1024,
        });
        agg.push(Frame::text("a").non_final()).unwrap();
        agg.push(continuation(b"b").non_final()).unwrap();
        assert_eq!(
            agg.push(continuation(b"c")),
            Err(AggregateError::TooManyFragments(2))
        );
    }

    #[test]
    fn test_empty_non_final_fragment_rejected() {
        let mut agg = aggregator();
        assert_eq!(
            agg.push(Frame::text("").non_final()),
            Err(AggregateError::FragmentTooSmall { size: 0, min: 1 })
        );
    }

    #[test]
    fn test_empty_final_continuation_is_allowed() {
        let mut agg = aggregator();
        agg.push(Frame::text("abc").non_final()).unwrap();
        let done = agg.push(continuation(b"")).unwrap().unwrap();
        assert_eq!(done.payload(), b"abc");
    }
}
