//! Packet codec
//!
//! Encoding and decoding for the broker's control packets: fixed-header
//! bit packing, the base-128 remaining-length field, and the per-type
//! variable-header/payload layouts.

mod decode;
mod encode;


pub use decode::{Decoder, FixedHeader, ReadError};
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum supported remaining length (2,097,151 bytes).
pub const MAX_REMAINING_LENGTH: usize = 2_097_151;

/// Maximum number of bytes in a remaining-length field. A stream claiming
/// a fifth continuation byte is malformed.
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Read a remaining-length field from a buffer.
/// Returns (value, bytes_consumed) or error.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= MAX_REMAINING_LENGTH_BYTES {
            return Err(DecodeError::InvalidRemainingLength);
        }
        if pos >= buf.len() {
            return Err(DecodeError::Truncated("remaining length"));
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a remaining-length field to a buffer.
/// Returns bytes written.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Read a two-byte big-endian integer, naming the field on truncation.
#[inline]
pub fn read_u16(buf: &[u8], field: &'static str) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::Truncated(field));
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a UTF-8 string with a two-byte length prefix.
/// Returns (string, bytes_consumed) or error.
#[inline]
pub fn read_string<'a>(buf: &'a [u8], field: &'static str) -> Result<(&'a str, usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::Truncated(field));
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::Truncated(field));
    }

    let s = std::str::from_utf8(&buf[2..total_len]).map_err(|_| DecodeError::InvalidUtf8)?;

    Ok((s, total_len))
}

/// Write a UTF-8 string with a two-byte length prefix.
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    let len = s.len();
    if len > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}
