//! Prefixed integer coding (RFC 7541 Section 5.1, reused by RFC 9204).
//!
//! The integer starts in the low `prefix_bits` bits of the current octet;
//! the high bits of that octet belong to the caller's instruction pattern.

use super::error::QpackError;

/// Append `value` using an N-bit prefix, OR-ing `flags` into the first octet.
pub fn encode(value: usize, prefix_bits: u8, flags: u8, buf: &mut Vec<u8>) {
    debug_assert!((1..=8).contains(&prefix_bits));
    let max_prefix = (1usize << prefix_bits) - 1;

    if value < max_prefix {
        buf.push(flags | value as u8);
        return;
    }

    buf.push(flags | max_prefix as u8);
    let mut remaining = value - max_prefix;
    while remaining >= 128 {
        buf.push((remaining % 128 + 128) as u8);
        remaining /= 128;
    }
    buf.push(remaining as u8);
}

/// Decode an N-bit prefixed integer from the front of `data`.
///
/// Returns `(value, bytes_consumed)`, counting the prefix octet.
pub fn decode(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), QpackError> {
    let first = *data.first().ok_or(QpackError::UnexpectedEof)?;
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = first as usize & max_prefix;
    if value < max_prefix {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    let mut pos = 1;
    loop {
        let byte = *data.get(pos).ok_or(QpackError::UnexpectedEof)?;
        pos += 1;
        let chunk = (byte & 0x7f) as usize;
        value = chunk
            .checked_shl(shift)
            .filter(|_| shift <= 56)
            .and_then(|c| value.checked_add(c))
            .ok_or(QpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7541_examples() {
        // C.1.1: 10 with a 5-bit prefix
        let mut buf = Vec::new();
        encode(10, 5, 0, &mut buf);
        assert_eq!(buf, [0x0a]);

        // C.1.2: 1337 with a 5-bit prefix
        let mut buf = Vec::new();
        encode(1337, 5, 0, &mut buf);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);
        assert_eq!(decode(&buf, 5).unwrap(), (1337, 3));

        // C.1.3: 42 starting at an octet boundary
        let mut buf = Vec::new();
        encode(42, 8, 0, &mut buf);
        assert_eq!(buf, [0x2a]);
    }

    #[test]
    fn test_flags_do_not_leak_into_value() {
        let mut buf = Vec::new();
        encode(17, 6, 0xc0, &mut buf);
        assert_eq!(buf, [0xd1]);
        assert_eq!(decode(&buf, 6).unwrap(), (17, 1));
    }

    #[test]
    fn test_truncated_continuation() {
        assert_eq!(decode(&[0x1f, 0x9a], 5), Err(QpackError::UnexpectedEof));
        assert_eq!(decode(&[], 5), Err(QpackError::UnexpectedEof));
    }

    #[test]
    fn test_overflow() {
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert_eq!(decode(&data, 8), Err(QpackError::IntegerOverflow));
    }
}
