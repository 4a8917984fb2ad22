//! QPACK-specific error types.

use thiserror::Error;

/// QPACK field-section decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QpackError {
    #[error("Unexpected end of field section")]
    UnexpectedEof,

    #[error("Integer overflow")]
    IntegerOverflow,

    #[error("Invalid Huffman code")]
    InvalidHuffmanCode,

    #[error("Invalid static table index: {0}")]
    InvalidStaticIndex(usize),

    #[error("Dynamic table reference in static-only field section")]
    DynamicReference,
}
