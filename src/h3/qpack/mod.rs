//! QPACK field compression (RFC 9204), static table only.
//!
//! The dynamic table is never used in either direction: SETTINGS leaves
//! QPACK_MAX_TABLE_CAPACITY at its default of 0 and the encoder only emits
//! static references and literals. Both halves are therefore stateless and
//! safe to share across streams.

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod huffman;
pub mod integer;
pub mod static_table;

use bytes::Bytes;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::QpackError;

/// A single header field as carried in a field section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pseudo-header fields start with ':'.
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}
