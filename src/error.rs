//! Error type shared by the reader and the writer.

use thiserror::Error;

/// Result type for PSD operations.
pub type Result<T> = core::result::Result<T, PsdError>;

/// Everything that can stop a load or a save.
///
/// Every variant is terminal for the call that produced it: there is no partial document on failure.
#[derive(Error, Debug)]
pub enum PsdError
{
    /// The input ended before a field could be read.
    #[error("Unexpected end of stream: needed {needed} bytes, {available} available")]
    Truncated { needed : usize, available : usize },

    /// A magic tag or version field did not hold its fixed value.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Well-formed PSD data that uses something this crate does not handle.
    #[error("Unsupported PSD feature: {0}")]
    UnsupportedFormat(String),

    /// A count or a dimension is over the configured [crate::Limits].
    #[error("{what} is {value}, over the limit of {limit}")]
    FormatLimitExceeded { what : &'static str, value : u64, limit : u64 },

    /// Lengths or contents that contradict each other.
    #[error("Corrupt PSD data: {0}")]
    CorruptData(String),

    /// The document handed to the writer does not describe itself consistently.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PsdError
{
    pub (crate) fn limit(what : &'static str, value : impl Into<u64>, limit : impl Into<u64>) -> Self
    {
        PsdError::FormatLimitExceeded { what, value : value.into(), limit : limit.into() }
    }
}
