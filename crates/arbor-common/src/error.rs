//! Error types for Arbor.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Block device / cache errors
    #[error("block {block} out of range (store has {num_blocks} blocks)")]
    BlockOutOfRange { block: u32, num_blocks: u32 },

    #[error("block size mismatch: expected {expected}, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    // Index errors
    #[error("no free blocks available")]
    NoSpace,

    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("operation not implemented")]
    Unimplemented,

    #[error("wrong node type: expected {expected}, got {actual}")]
    WrongNodeType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("slot {index} out of bounds (limit {limit})")]
    SlotOutOfBounds { index: u32, limit: u32 },

    #[error("key size mismatch: expected {expected}, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("value size mismatch: expected {expected}, got {actual}")]
    ValueSizeMismatch { expected: usize, actual: usize },

    #[error("tree corrupted: {0}")]
    TreeCorrupted(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    ConfigError(String),
}
