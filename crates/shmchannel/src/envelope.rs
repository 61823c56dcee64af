//! Message envelope encoding.
//!
//! ```text
//! [destination: string]
//! ( [0xFFA1 u16 LE] [key: string] [value: string] )*
//! [0xFFA2 u16 LE]
//! [body length: i32 LE] [body bytes]
//! ```
//!
//! Strings are UTF-8 prefixed with their byte length as a 7-bit varint.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_MARKER: u16 = 0xFFA1;
pub const END_MARKER: u16 = 0xFFA2;

/// Header holding the object path a request was addressed to.
pub const REQUEST_URI_HEADER: &str = "__RequestUri";

/// Headers with this prefix are local-only and never transmitted.
pub const RESERVED_PREFIX: &str = "__";

/// Ordered transport headers. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeaders {
    entries: Vec<(String, String)>,
}

impl TransportHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace, keeping the original position of a replaced key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The object path the message was addressed to, if recorded.
    pub fn request_uri(&self) -> Option<&str> {
        self.get(REQUEST_URI_HEADER)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TransportHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Failure to decode an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof { needed: usize, remaining: usize },
    InvalidUtf8,
    VarintOverflow,
    UnknownMarker(u16),
    NegativeLength(i32),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof { needed, remaining } => {
                write!(f, "message truncated: need {needed} bytes, have {remaining}")
            }
            DecodeError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            DecodeError::VarintOverflow => write!(f, "string length prefix overflows"),
            DecodeError::UnknownMarker(m) => write!(f, "unknown header marker {m:#06x}"),
            DecodeError::NegativeLength(n) => write!(f, "negative body length {n}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Length prefix of a string, which the wire limits to 32 bits.
fn string_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {len} bytes exceeds 4 GiB"),
        )
    })
}

/// Body length prefix, a signed 32-bit value on the wire.
fn body_len(len: usize) -> io::Result<i32> {
    i32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message body of {len} bytes exceeds 2 GiB"),
        )
    })
}

/// Staging buffer for one outgoing message.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_string(&mut self, s: &str) -> io::Result<()> {
        let mut len = string_len(s.len())?;
        while len >= 0x80 {
            self.buf.put_u8((len as u8) | 0x80);
            len >>= 7;
        }
        self.buf.put_u8(len as u8);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn write_marker(&mut self, marker: u16) {
        self.buf.put_u16_le(marker);
    }

    /// Destination then every transmittable header, then the end marker.
    pub fn write_headers(
        &mut self,
        destination: &str,
        headers: &TransportHeaders,
    ) -> io::Result<()> {
        self.write_string(destination)?;
        for (key, value) in headers.iter() {
            if key.starts_with(RESERVED_PREFIX) {
                continue;
            }
            self.write_marker(HEADER_MARKER);
            self.write_string(key)?;
            self.write_string(value)?;
        }
        self.write_marker(END_MARKER);
        Ok(())
    }

    pub fn write_body(&mut self, body: &[u8]) -> io::Result<()> {
        self.buf.put_i32_le(body_len(body.len())?);
        self.buf.put_slice(body);
        Ok(())
    }

    /// Drain `reader` into the body section. Returns the body length.
    pub fn write_body_from(&mut self, reader: &mut dyn Read) -> io::Result<usize> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        self.write_body(&body)?;
        Ok(body.len())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append raw bytes without framing.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }
}

/// Cursor over one fully received message.
#[derive(Debug, Clone)]
pub struct MessageReader {
    buf: Bytes,
}

impl MessageReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Everything not yet consumed.
    pub fn into_bytes(self) -> Bytes {
        self.buf
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn read_varint(&mut self) -> Result<usize, DecodeError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            self.need(1)?;
            let byte = self.buf.get_u8();
            if shift == 28 && byte > 0x07 {
                return Err(DecodeError::VarintOverflow);
            }
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value as usize);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_varint()?;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn read_marker(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Read the destination and headers.
    ///
    /// A destination that is a channel URL is reduced to its object path.
    /// The result is recorded under [`REQUEST_URI_HEADER`].
    pub fn read_headers(&mut self) -> Result<TransportHeaders, DecodeError> {
        let destination = self.read_string()?;
        let mut headers = TransportHeaders::new();
        if !destination.is_empty() {
            match crate::url::parse(&destination) {
                Some((_, Some(object))) => headers.insert(REQUEST_URI_HEADER, object),
                Some((_, None)) => {}
                None => headers.insert(REQUEST_URI_HEADER, destination),
            }
        }
        loop {
            match self.read_marker()? {
                HEADER_MARKER => {
                    let key = self.read_string()?;
                    let value = self.read_string()?;
                    headers.insert(key, value);
                }
                END_MARKER => return Ok(headers),
                other => return Err(DecodeError::UnknownMarker(other)),
            }
        }
    }

    pub fn read_body(&mut self) -> Result<Bytes, DecodeError> {
        self.need(4)?;
        let len = self.buf.get_i32_le();
        if len < 0 {
            return Err(DecodeError::NegativeLength(len));
        }
        let len = len as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }
}
