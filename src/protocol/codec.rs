//! Wire encoding and decoding primitives shared by the protocol codecs.
//!
//! Read helpers return the value and the remaining input. Malformed input
//! inside a complete frame is always a fatal protocol error: the frame
//! boundaries can no longer be trusted.

use crate::error::{Error, Result};
use zerocopy::FromBytes;

use super::types::{I16BE, I32BE, U16BE, U16LE, U32BE, U32LE, U64LE};

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&b, rest)) => Ok((b, rest)),
        None => Err(Error::fatal_protocol("read_u8: empty buffer")),
    }
}

macro_rules! read_fixed {
    ($(#[$doc:meta])* $fn_name:ident, $wire:ty, $native:ty, $len:expr) => {
        $(#[$doc])*
        #[inline]
        pub fn $fn_name(data: &[u8]) -> Result<($native, &[u8])> {
            if data.len() < $len {
                return Err(Error::fatal_protocol(format!(
                    concat!(stringify!($fn_name), ": buffer too short: {} < {}"),
                    data.len(),
                    $len
                )));
            }
            let (head, rest) = data.split_at($len);
            let value = <$wire>::ref_from_bytes(head)?.get();
            Ok((value, rest))
        }
    };
}

read_fixed!(
    /// Read 2-byte big-endian signed integer.
    read_i16, I16BE, i16, 2
);
read_fixed!(
    /// Read 2-byte big-endian unsigned integer.
    read_u16, U16BE, u16, 2
);
read_fixed!(
    /// Read 4-byte big-endian signed integer.
    read_i32, I32BE, i32, 4
);
read_fixed!(
    /// Read 4-byte big-endian unsigned integer.
    read_u32, U32BE, u32, 4
);
read_fixed!(
    /// Read 2-byte little-endian unsigned integer.
    read_u16_le, U16LE, u16, 2
);
read_fixed!(
    /// Read 4-byte little-endian unsigned integer.
    read_u32_le, U32LE, u32, 4
);
read_fixed!(
    /// Read 8-byte little-endian unsigned integer.
    read_u64_le, U64LE, u64, 8
);

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(Error::fatal_protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            len
        )));
    }
    Ok(data.split_at(len))
}

/// Read null-terminated string.
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::fatal_protocol(
            "read_cstring: no null terminator found",
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    Ok((utf8(bytes)?, rest))
}

/// Validate UTF-8 in a server-provided name or message.
#[inline]
pub fn utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::fatal_protocol(format!("invalid UTF-8: {e}")))
}

/// Write 2-byte big-endian signed integer.
#[inline]
pub fn write_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 2-byte big-endian unsigned integer.
#[inline]
pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 4-byte big-endian signed integer.
#[inline]
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write null-terminated string.
#[inline]
pub fn write_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Builder for a frame whose length field is patched in on `finish`.
///
/// The length field is written at `start` and, depending on the protocol,
/// counts itself (PostgreSQL, DRDA) or only the payload after it (MySQL).
pub struct FrameBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
    width: LengthField,
}

/// Layout of a frame length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// 4-byte big-endian, counts itself and the payload
    I32BEInclusive,
    /// 2-byte big-endian, counts itself and the payload
    U16BEInclusive,
    /// 3-byte little-endian, counts the payload after a 1-byte sequence id
    U24LEPayload,
}

impl LengthField {
    fn size(self) -> usize {
        match self {
            LengthField::I32BEInclusive => 4,
            LengthField::U16BEInclusive => 2,
            LengthField::U24LEPayload => 3,
        }
    }

    /// Largest length the field can carry.
    pub fn max_len(self) -> usize {
        match self {
            LengthField::I32BEInclusive => i32::MAX as usize,
            LengthField::U16BEInclusive => 0x7FFF,
            // a payload of exactly 0xFFFFFF announces a continuation packet
            LengthField::U24LEPayload => 0xFF_FF_FE,
        }
    }
}

impl<'a> FrameBuilder<'a> {
    /// Start a frame; the placeholder length is written at the current end of `buf`.
    pub fn new(buf: &'a mut Vec<u8>, width: LengthField) -> Self {
        let start = buf.len();
        buf.extend(std::iter::repeat_n(0, width.size()));
        Self { buf, start, width }
    }

    /// Start a PostgreSQL message with a type byte.
    pub fn with_type(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        Self::new(buf, LengthField::I32BEInclusive)
    }

    /// Get mutable access to the underlying buffer.
    pub fn buf(&mut self) -> &mut Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        write_i16(self.buf, value);
    }

    pub fn write_u16(&mut self, value: u16) {
        write_u16(self.buf, value);
    }

    pub fn write_i32(&mut self, value: i32) {
        write_i32(self.buf, value);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_cstr(&mut self, s: &str) {
        write_cstr(self.buf, s);
    }

    /// Fill in the length field. Fails if the frame outgrew the field.
    pub fn finish(self) -> Result<()> {
        let total = self.buf.len() - self.start;
        let len = match self.width {
            LengthField::I32BEInclusive | LengthField::U16BEInclusive => total,
            // sequence id byte is not part of the payload length
            LengthField::U24LEPayload => total.saturating_sub(4),
        };
        let limit = self.width.max_len();
        if len > limit {
            self.buf.truncate(self.start);
            return Err(Error::PayloadTooLarge { size: len, limit });
        }
        let at = self.start;
        match self.width {
            LengthField::I32BEInclusive => {
                self.buf[at..at + 4].copy_from_slice(&(len as i32).to_be_bytes());
            }
            LengthField::U16BEInclusive => {
                self.buf[at..at + 2].copy_from_slice(&(len as u16).to_be_bytes());
            }
            LengthField::U24LEPayload => {
                self.buf[at..at + 3].copy_from_slice(&(len as u32).to_le_bytes()[..3]);
            }
        }
        Ok(())
    }
}
