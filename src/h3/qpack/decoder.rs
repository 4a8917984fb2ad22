//! QPACK decoder for field sections that reference only the static table.

use bytes::Bytes;

use super::error::QpackError;
use super::static_table;
use super::{huffman, integer, HeaderField};

/// Stateless QPACK decoder.
///
/// Any reference to the dynamic table is rejected: this client advertises a
/// dynamic table capacity of zero, so a conforming peer never sends one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a complete field section.
    pub fn decode_full(&self, data: &[u8]) -> Result<Vec<HeaderField>, QpackError> {
        let (required_insert_count, consumed) = integer::decode(data, 8)?;
        if required_insert_count != 0 {
            return Err(QpackError::DynamicReference);
        }
        let mut pos = consumed;
        // Sign bit and Delta Base; meaningless without a dynamic table
        let (_, consumed) = integer::decode(&data[pos..], 7)?;
        pos += consumed;

        let mut fields = Vec::new();
        while pos < data.len() {
            let byte = data[pos];

            // Indexed field line: 1 T index(6)
            if byte & 0x80 != 0 {
                if byte & 0x40 == 0 {
                    return Err(QpackError::DynamicReference);
                }
                let (idx, consumed) = integer::decode(&data[pos..], 6)?;
                pos += consumed;
                let (name, value) = static_entry(idx)?;
                fields.push(HeaderField::new(
                    Bytes::from_static(name),
                    Bytes::from_static(value),
                ));
                continue;
            }

            // Literal field line with name reference: 01 N T index(4)
            if byte & 0xc0 == 0x40 {
                if byte & 0x10 == 0 {
                    return Err(QpackError::DynamicReference);
                }
                let (idx, consumed) = integer::decode(&data[pos..], 4)?;
                pos += consumed;
                let (name, _) = static_entry(idx)?;
                let (value, consumed) = decode_string(&data[pos..], 7)?;
                pos += consumed;
                fields.push(HeaderField::new(Bytes::from_static(name), value));
                continue;
            }

            // Literal field line with literal name: 001 N H len(3)
            if byte & 0xe0 == 0x20 {
                let (name, consumed) = decode_string(&data[pos..], 3)?;
                pos += consumed;
                let (value, consumed) = decode_string(&data[pos..], 7)?;
                pos += consumed;
                fields.push(HeaderField::new(name, value));
                continue;
            }

            // 0001xxxx indexed post-base, 0000xxxx literal post-base name
            return Err(QpackError::DynamicReference);
        }

        Ok(fields)
    }
}

fn static_entry(idx: usize) -> Result<static_table::StaticEntry, QpackError> {
    static_table::get(idx).ok_or(QpackError::InvalidStaticIndex(idx))
}

/// Decode a string literal whose Huffman flag sits just above the length prefix.
fn decode_string(data: &[u8], prefix_bits: u8) -> Result<(Bytes, usize), QpackError> {
    let first = *data.first().ok_or(QpackError::UnexpectedEof)?;
    let huffman_coded = first & (1 << prefix_bits) != 0;
    let (len, consumed) = integer::decode(data, prefix_bits)?;
    let end = consumed
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or(QpackError::UnexpectedEof)?;
    let raw = &data[consumed..end];
    let value = if huffman_coded {
        Bytes::from(huffman::decode(raw)?)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((value, end))
}
