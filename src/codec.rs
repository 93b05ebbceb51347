use bytes::buf::{Buf, BufMut};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio_util::codec::*;

use crate::error::FrameError;

/// Vertical-Tab char, the marker for the start of a message
pub const START_OF_BLOCK: u8 = 0x0B;
/// File-Separator char, the marker for the end of a message
pub const END_OF_BLOCK: u8 = 0x1C;
/// CR, must directly follow the END_OF_BLOCK
pub const END_OF_DATA: u8 = 0x0D;

/// Wraps a payload in an MLLP envelope.
/// ```
/// let framed = hl7_mllp_server::frame(b"MSA|AA|");
/// assert_eq!(&framed[..], b"\x0BMSA|AA|\x1C\x0D");
/// ```
pub fn frame(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(payload.len() + 3);
    write_frame(payload, &mut dst);
    dst.freeze()
}

fn write_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + 3); //we need an extra 3 bytes of space on top of the message proper
    dst.put_u8(START_OF_BLOCK);
    dst.put_slice(payload);
    dst.put_u8(END_OF_BLOCK);
    dst.put_u8(END_OF_DATA);
}

/// The state of our state machine
#[derive(Clone, Copy, Debug, PartialEq)]
enum ParseState {
    /// We are waiting for a StartBlock byte to indicate a new message, anything else is discarded
    WaitingForStartBlock,
    /// All data is considered message data, we're waiting to see an End Block byte/Carriage Return combo
    ReadingData,
}

/// Tokio codec that extracts MLLP frames from a byte stream and wraps outbound payloads.
///
/// Partial frames are held in the read buffer between calls, and the codec remembers how far
/// it has already searched for a footer so large frames arriving in many reads are not
/// rescanned from the start each time.
#[derive(Debug)]
pub struct MllpCodec {
    state: ParseState,
    // offset into the frame data (after the start block) already searched for a footer
    scanned: usize,
    max_frame_length: Option<usize>,
    require_end_of_data: bool,
}

impl Default for MllpCodec {
    fn default() -> Self {
        MllpCodec::new()
    }
}

impl MllpCodec {
    /// Creates a new Codec instance, generally for use within a [Tokio Framed](https://docs.rs/tokio-util/latest/tokio_util/codec/struct.Framed.html),
    /// but can be instantiated standalone for testing purposes etc.
    /// ```
    /// use hl7_mllp_server::MllpCodec;
    /// let mllp = MllpCodec::new();
    /// assert!(!mllp.is_mid_frame());
    /// ```
    pub fn new() -> Self {
        MllpCodec {
            state: ParseState::WaitingForStartBlock,
            scanned: 0,
            max_frame_length: None,
            require_end_of_data: !cfg!(feature = "noncompliance"),
        }
    }

    /// Frames whose payload grows past `max` bytes are rejected with [`FrameError::FrameTooLarge`].
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = Some(max);
        self
    }

    /// When `false`, an END_OF_BLOCK byte terminates a frame even without the trailing CR.
    pub fn with_require_end_of_data(mut self, required: bool) -> Self {
        self.require_end_of_data = required;
        self
    }

    /// True once a start block has been seen and the frame is not yet complete.
    pub fn is_mid_frame(&self) -> bool {
        self.state == ParseState::ReadingData
    }

    fn reset(&mut self) {
        self.state = ParseState::WaitingForStartBlock;
        self.scanned = 0;
    }

    /// Splits the payload (everything before `footer_at`) off the buffer, consuming `footer_len` footer bytes.
    fn take_frame(&mut self, src: &mut BytesMut, footer_at: usize, footer_len: usize) -> BytesMut {
        let payload = src.split_to(footer_at);
        src.advance(footer_len);
        self.reset();
        trace!("MLLP: Extracted frame of {} bytes", payload.len());
        payload
    }

    /// Hands out a terminated frame, unless its payload is over the configured maximum.
    fn complete_frame(
        &mut self,
        src: &mut BytesMut,
        footer_at: usize,
        footer_len: usize,
    ) -> Result<Option<BytesMut>, FrameError> {
        match self.max_frame_length {
            Some(max) if footer_at > max => {
                // skip the whole frame so a caller that carries on stays aligned
                src.advance(footer_at + footer_len);
                self.reset();
                Err(FrameError::FrameTooLarge { max })
            }
            _ => Ok(Some(self.take_frame(src, footer_at, footer_len))),
        }
    }

    fn decode_data(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        loop {
            let scan_from = self.scanned.min(src.len());
            let footer_at = match src[scan_from..]
                .iter()
                .position(|b| *b == END_OF_BLOCK)
            {
                Some(offset) => scan_from + offset,
                None => {
                    self.scanned = src.len();
                    break;
                }
            };

            match src.get(footer_at + 1).copied() {
                Some(END_OF_DATA) => return self.complete_frame(src, footer_at, 2),
                Some(_) if !self.require_end_of_data => {
                    debug!("MLLP: End block without trailing CR accepted as frame end");
                    return self.complete_frame(src, footer_at, 1);
                }
                Some(_) => {
                    // a lone end block is payload as far as we're concerned
                    trace!("MLLP: End block at {} not followed by CR, treating as data", footer_at);
                    self.scanned = footer_at + 1;
                }
                None => {
                    // need the next byte before we can decide
                    self.scanned = footer_at;
                    break;
                }
            }
        }

        // everything before `scanned` is payload, a trailing end block may still be the footer
        if let Some(max) = self.max_frame_length {
            if self.scanned > max {
                src.clear();
                self.reset();
                return Err(FrameError::FrameTooLarge { max });
            }
        }

        Ok(None)
    }
}

// Support encoding data as an MLLP Frame.
// This is used for any ACK/NACK messages sent from the server.
impl Encoder<BytesMut> for MllpCodec {
    type Error = FrameError;

    fn encode(&mut self, event: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&event, dst);
        debug!("MLLP: Encoded value for send: '{:?}'", dst);
        Ok(())
    }
}

impl Encoder<Bytes> for MllpCodec {
    type Error = FrameError;

    fn encode(&mut self, event: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&event, dst);
        debug!("MLLP: Encoded value for send: '{:?}'", dst);
        Ok(())
    }
}

// Support decoding data from an MLLP Frame.
impl Decoder for MllpCodec {
    type Item = BytesMut; // the raw payload, interpretation happens further up
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.state == ParseState::WaitingForStartBlock {
            // we DO have to ignore any bytes prior to the START_OF_BLOCK per the MLLP standard
            match src.iter().position(|b| *b == START_OF_BLOCK) {
                Some(start_offset) => {
                    if start_offset > 0 {
                        debug!("MLLP: Discarding {} bytes before start block", start_offset);
                    }
                    src.advance(start_offset + 1);
                    self.state = ParseState::ReadingData;
                    self.scanned = 0;
                }
                None => {
                    if !src.is_empty() {
                        debug!("MLLP: Discarding {} bytes with no start block", src.len());
                        src.clear();
                    }
                    return Ok(None);
                }
            }
        }

        self.decode_data(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.state {
            ParseState::WaitingForStartBlock => {
                src.clear();
                Ok(None)
            }
            ParseState::ReadingData => {
                if !self.require_end_of_data && src.last() == Some(&END_OF_BLOCK) {
                    let footer_at = src.len() - 1;
                    return self.complete_frame(src, footer_at, 1);
                }
                let partial = src.split();
                self.reset();
                Err(FrameError::Truncated { partial })
            }
        }
    }
}
