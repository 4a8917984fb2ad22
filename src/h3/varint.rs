//! QUIC variable-length integers (RFC 9000 Section 16).
//!
//! The two most significant bits of the first byte select a 1, 2, 4 or 8 byte
//! encoding; the remaining bits carry the value in network byte order.

use std::io;

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest value representable as a varint (2^62 - 1).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes needed to encode `value`.
pub fn encoded_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Total encoded length announced by the first byte of a varint.
pub fn len_from_first_byte(first: u8) -> usize {
    1 << (first >> 6)
}

/// Append `value` to `buf`.
///
/// Values above [`MAX_VARINT`] cannot be represented; they are truncated to
/// the low 62 bits, so callers must only pass ids and lengths that fit.
pub fn encode<B: BufMut>(value: u64, buf: &mut B) {
    debug_assert!(value <= MAX_VARINT, "varint out of range: {}", value);
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | (value & MAX_VARINT)),
    }
}

/// Decode a varint from the front of `input`.
///
/// Returns `(value, consumed)`, or `None` when `input` is too short.
pub fn decode(input: &[u8]) -> Option<(u64, usize)> {
    let first = *input.first()?;
    let len = len_from_first_byte(first);
    if input.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for b in &input[1..len] {
        value = (value << 8) | u64::from(*b);
    }
    Some((value, len))
}

/// Read one varint from an async byte source.
///
/// A clean end of stream before the first byte is reported as
/// `UnexpectedEof`, same as a truncated varint.
pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let first = reader.read_u8().await?;
    let len = len_from_first_byte(first);
    let mut value = u64::from(first & 0x3f);
    for _ in 1..len {
        value = (value << 8) | u64::from(reader.read_u8().await?);
    }
    Ok(value)
}
