//! Incremental frame decoding

use bytes::{Bytes, BytesMut};

use weir_core::{WeirError, WeirResult};

use crate::LENGTH_PREFIX_SIZE;

/// Decoder position: filling the fixed 4-byte header slot, or filling a
/// payload buffer allocated to the declared length.
enum DecodeState {
    Header {
        buf: [u8; LENGTH_PREFIX_SIZE],
        filled: usize,
    },
    Payload {
        buf: BytesMut,
        filled: usize,
    },
}

impl DecodeState {
    fn header() -> DecodeState {
        DecodeState::Header {
            buf: [0; LENGTH_PREFIX_SIZE],
            filled: 0,
        }
    }
}

/// Incremental length-prefix decoder.
///
/// Sockets read directly into [`read_target`](FrameDecoder::read_target);
/// [`advance`](FrameDecoder::advance) consumes the bytes just written and
/// yields a message whenever one completes. The payload buffer is allocated
/// per message at the declared size and frozen into `Bytes` on completion,
/// so the decoded payload is handed off without copying.
///
/// A decode error is fatal to its connection; the decoder is not resumable
/// after returning one.
pub struct FrameDecoder {
    max_frame_size: usize,
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        FrameDecoder {
            max_frame_size,
            state: DecodeState::header(),
        }
    }

    /// The unfilled remainder of the current decode buffer. Never empty
    /// while the decoder is healthy.
    pub fn read_target(&mut self) -> &mut [u8] {
        match &mut self.state {
            DecodeState::Header { buf, filled } => &mut buf[*filled..],
            DecodeState::Payload { buf, filled } => &mut buf[*filled..],
        }
    }

    /// Consume `n` bytes just written into `read_target`. Returns a
    /// completed message, `None` if more bytes are needed, or the framing
    /// violation that kills the connection.
    pub fn advance(&mut self, n: usize) -> WeirResult<Option<Bytes>> {
        let (next, out) = match &mut self.state {
            DecodeState::Header { buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= LENGTH_PREFIX_SIZE);
                if *filled < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let declared = i32::from_be_bytes(*buf);
                if declared < 0 {
                    return Err(WeirError::NegativeFrameLength(declared));
                }
                let declared = declared as usize;
                if declared > self.max_frame_size {
                    return Err(WeirError::FrameTooLarge {
                        declared,
                        limit: self.max_frame_size,
                    });
                }
                if declared == 0 {
                    (DecodeState::header(), Some(Bytes::new()))
                } else {
                    let mut payload = BytesMut::with_capacity(declared);
                    payload.resize(declared, 0);
                    (
                        DecodeState::Payload {
                            buf: payload,
                            filled: 0,
                        },
                        None,
                    )
                }
            }
            DecodeState::Payload { buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= buf.len());
                if *filled < buf.len() {
                    return Ok(None);
                }
                (DecodeState::header(), Some(std::mem::take(buf).freeze()))
            }
        };
        self.state = next;
        Ok(out)
    }
}
