//! Static-table-only QPACK encoder (RFC 9204 Section 4.5).
//!
//! The field section prefix always announces a Required Insert Count of 0,
//! so the peer never has to wait on the encoder stream.

use bytes::Bytes;

use super::integer;
use super::static_table::{find, find_name};
use super::{huffman, HeaderField};

/// QPACK encoder that never touches the dynamic table.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a complete field section.
    pub fn encode(&self, fields: &[HeaderField]) -> Bytes {
        let mut output = Vec::with_capacity(2 + fields.len() * 16);
        // Required Insert Count = 0, Base = 0
        output.extend_from_slice(&[0x00, 0x00]);

        for field in fields {
            encode_field(&field.name, &field.value, &mut output);
        }

        Bytes::from(output)
    }
}

fn encode_field(name: &[u8], value: &[u8], output: &mut Vec<u8>) {
    // Indexed field line, static: 1 T=1 index(6)
    if let Some(idx) = find(name, value) {
        integer::encode(idx, 6, 0xc0, output);
        return;
    }

    // Literal field line with static name reference: 01 N=0 T=1 index(4)
    if let Some(idx) = find_name(name) {
        integer::encode(idx, 4, 0x50, output);
        encode_string(value, 7, 0x00, output);
        return;
    }

    // Literal field line with literal name: 001 N=0 H len(3)
    encode_string(name, 3, 0x20, output);
    encode_string(value, 7, 0x00, output);
}

/// Write a string literal; the Huffman flag sits just above the length prefix.
fn encode_string(value: &[u8], prefix_bits: u8, flags: u8, output: &mut Vec<u8>) {
    let huffman_flag = 1u8 << prefix_bits;
    let huffman_len = huffman::encoded_len(value);
    if huffman_len < value.len() {
        integer::encode(huffman_len, prefix_bits, flags | huffman_flag, output);
        huffman::encode(value, output);
    } else {
        integer::encode(value.len(), prefix_bits, flags, output);
        output.extend_from_slice(value);
    }
}
