//! Tessera Array Storage Engine
//!
//! An embedded multi-dimensional array storage engine implemented in Rust.
//! Arrays are persisted as sequences of immutable fragments; each fragment
//! holds compressed tiles of cell data. The query core answers subarray
//! reads over dense and sparse arrays with fragment recency precedence,
//! and appends new fragments on writes.

pub mod array;
pub mod cache;
pub mod fragment;
pub mod query;
pub mod storage;

// Re-export main types
pub use array::{ArraySchema, Attribute, Datatype, DomainValue, Layout, COORDS};
pub use fragment::FragmentMetadata;
pub use query::{CancelToken, Query, QueryBuffer, QueryStatus, QueryType};
pub use storage::{CompressionType, StorageConfig, StorageManager};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid subarray: {0}")]
    InvalidSubarray(String),

    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),

    #[error("Buffer count mismatch: expected {expected}, got {actual}")]
    BufferCountMismatch { expected: usize, actual: usize },

    #[error("Unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("Corrupt tile: {0}")]
    CorruptTile(String),

    #[error("Invalid file format")]
    InvalidFileFormat,

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Fragment not found: {0}")]
    FragmentNotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid query state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, TesseraError>;
