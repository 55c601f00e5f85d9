use std::fmt;
use std::io::{self, Read, Write};

use crate::config::AppConfig;

pub const MAX_PAYLOAD_SIZE_BYTES: usize = 8 * 1024 * 1024;
/// `tag:int32, requestType:int16, length:int32`, big-endian.
pub const FRAME_HEADER_SIZE_BYTES: usize = 10;

/// One tagged message. The tag is echoed verbatim in the matching response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub request_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u32, request_type: u16, payload: Vec<u8>) -> Self {
        Self {
            tag,
            request_type,
            payload,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    /// Stream ended partway through a frame.
    TruncatedFrame { expected: usize, received: usize },
    NegativeLength { length: i32 },
    LengthTooLarge { length: usize, limit: usize },
    TrailingBytes { extra: usize },
    /// Stream ended cleanly on a frame boundary.
    ConnectionClosed,
    Io(io::Error),
}

impl CodecError {
    /// Malformed input as opposed to a dead transport.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedFrame { expected, received } => write!(
                f,
                "protocol error: truncated frame, expected {expected} bytes, got {received}"
            ),
            Self::NegativeLength { length } => {
                write!(f, "protocol error: negative payload length {length}")
            }
            Self::LengthTooLarge { length, limit } => write!(
                f,
                "protocol error: payload length {length} exceeds max {limit}"
            ),
            Self::TrailingBytes { extra } => {
                write!(f, "protocol error: {extra} bytes after end of frame")
            }
            Self::ConnectionClosed => write!(f, "connection closed by peer"),
            Self::Io(source) => write!(f, "wire io error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_payload_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_size_bytes: MAX_PAYLOAD_SIZE_BYTES,
        }
    }
}

/// Stateless frame codec. Holds only the payload size limit, so it is `Copy`
/// and every connection carries its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self::new(CodecConfig {
            max_payload_size_bytes: app_config.wire.max_payload_size_bytes,
        })
    }

    pub fn max_payload_size_bytes(&self) -> usize {
        self.config.max_payload_size_bytes
    }

    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        self.check_length(frame.payload.len())?;

        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + frame.payload.len());
        bytes.extend_from_slice(&frame.tag.to_be_bytes());
        bytes.extend_from_slice(&frame.request_type.to_be_bytes());
        bytes.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&frame.payload);
        Ok(bytes)
    }

    /// Decodes exactly one frame from a complete buffer.
    pub fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        let mut cursor = bytes;
        let frame = self.read_frame(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(CodecError::TrailingBytes {
                extra: cursor.len(),
            });
        }
        Ok(frame)
    }

    /// Writes one frame with a single `write_all` so a frame is never split
    /// between concurrent writers sharing the same locked stream.
    pub fn write_frame<W: Write>(&self, writer: &mut W, frame: &Frame) -> Result<(), CodecError> {
        let bytes = self.encode_frame(frame)?;
        writer.write_all(&bytes).map_err(CodecError::Io)?;
        writer.flush().map_err(CodecError::Io)
    }

    /// Blocks until a whole frame is available. Partial frames are never
    /// returned.
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> Result<Frame, CodecError> {
        let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
        match read_full(reader, &mut header).map_err(CodecError::Io)? {
            0 => return Err(CodecError::ConnectionClosed),
            n if n < FRAME_HEADER_SIZE_BYTES => {
                return Err(CodecError::TruncatedFrame {
                    expected: FRAME_HEADER_SIZE_BYTES,
                    received: n,
                })
            }
            _ => {}
        }

        let tag = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let request_type = u16::from_be_bytes([header[4], header[5]]);
        let declared = i32::from_be_bytes([header[6], header[7], header[8], header[9]]);
        if declared < 0 {
            return Err(CodecError::NegativeLength { length: declared });
        }
        let length = declared as usize;
        self.check_length(length)?;

        let mut payload = vec![0_u8; length];
        let received = read_full(reader, &mut payload).map_err(CodecError::Io)?;
        if received < length {
            return Err(CodecError::TruncatedFrame {
                expected: FRAME_HEADER_SIZE_BYTES + length,
                received: FRAME_HEADER_SIZE_BYTES + received,
            });
        }

        Ok(Frame::new(tag, request_type, payload))
    }

    fn check_length(&self, length: usize) -> Result<(), CodecError> {
        let limit = self.config.max_payload_size_bytes.min(i32::MAX as usize);
        if length > limit {
            return Err(CodecError::LengthTooLarge { length, limit });
        }
        Ok(())
    }
}

/// Like `read_exact`, but reports how many bytes arrived before EOF instead
/// of collapsing every short read into `UnexpectedEof`.
fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}
