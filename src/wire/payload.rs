//! Big-endian payload primitives shared by request/response bodies and the
//! on-disk formats. Strings are a `u16` byte length followed by UTF-8.

use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum PayloadError {
    UnexpectedEnd { needed: usize, remaining: usize },
    InvalidUtf8,
    StringTooLong { length: usize },
    NegativeCount { count: i32 },
    TrailingBytes { extra: usize },
    ValueOutOfRange { field: &'static str, value: i32 },
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd { needed, remaining } => write!(
                f,
                "payload ended early: needed {needed} bytes, {remaining} remaining"
            ),
            Self::InvalidUtf8 => write!(f, "payload string is not valid UTF-8"),
            Self::StringTooLong { length } => {
                write!(f, "string of {length} bytes exceeds the 65535 byte limit")
            }
            Self::NegativeCount { count } => write!(f, "negative element count {count}"),
            Self::TrailingBytes { extra } => write!(f, "{extra} unexpected bytes after payload"),
            Self::ValueOutOfRange { field, value } => write!(f, "{field} {value} is out of range"),
        }
    }
}

impl std::error::Error for PayloadError {}

#[derive(Debug, Default)]
pub struct PayloadWriter {
    bytes: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.bytes.push(u8::from(value));
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_bits().to_be_bytes());
        self
    }

    pub fn put_str(&mut self, value: &str) -> Result<&mut Self, PayloadError> {
        let length = u16::try_from(value.len()).map_err(|_| PayloadError::StringTooLong {
            length: value.len(),
        })?;
        self.bytes.extend_from_slice(&length.to_be_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    /// Collection sizes travel as `int32`.
    pub fn put_count(&mut self, count: usize) -> &mut Self {
        self.put_i32(i32::try_from(count).unwrap_or(i32::MAX))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug)]
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn bool(&mut self) -> Result<bool, PayloadError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn i32(&mut self) -> Result<i32, PayloadError> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn f64(&mut self) -> Result<f64, PayloadError> {
        let raw = self.take(8)?;
        let mut buffer = [0_u8; 8];
        buffer.copy_from_slice(raw);
        Ok(f64::from_bits(u64::from_be_bytes(buffer)))
    }

    pub fn string(&mut self) -> Result<String, PayloadError> {
        let raw = self.take(2)?;
        let length = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let text = self.take(length)?;
        std::str::from_utf8(text)
            .map(str::to_owned)
            .map_err(|_| PayloadError::InvalidUtf8)
    }

    pub fn count(&mut self) -> Result<usize, PayloadError> {
        let count = self.i32()?;
        usize::try_from(count).map_err(|_| PayloadError::NegativeCount { count })
    }

    /// Fails if anything is left unread.
    pub fn finish(&self) -> Result<(), PayloadError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(PayloadError::TrailingBytes { extra }),
        }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], PayloadError> {
        if self.remaining() < needed {
            return Err(PayloadError::UnexpectedEnd {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.position..self.position + needed];
        self.position += needed;
        Ok(slice)
    }
}
