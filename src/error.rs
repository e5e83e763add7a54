//! Typed error kinds.
//!
//! Most fallible paths in this crate return [`eyre::Result`] and propagate
//! with `?`. The variants here exist for the handful of conditions callers
//! must distinguish programmatically: a reorganization rejected because the
//! chain is too long, a checksum mismatch on read, and I/O failures that
//! bubble up from the segment files. They are embedded in `eyre` reports and
//! can be recovered with `Report::downcast_ref::<StorageError>()`.

use thiserror::Error;

/// Externally meaningful failure kinds.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested key or entry is absent. Point lookups normally express
    /// this as `Ok(None)`; the variant exists for paths that must fail.
    #[error("not found")]
    NotFound,

    /// A configuration or usage error, including a chain too long to
    /// reorganize within the maximum fanout.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A checksum mismatch on read.
    #[error("corruption: {0}")]
    Corruption(String),

    /// An underlying file operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
