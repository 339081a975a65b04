//! Error types for the BCP database layer.

use thiserror::Error;

/// Any failure raised by the flat-file database.
#[derive(Debug, Error)]
pub enum BcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A problem with the database files themselves (missing tables,
    /// mismatched formats, files out of order).
    #[error("operational error: {0}")]
    Operational(String),

    /// A malformed entry in a data file.
    #[error("data syntax error: {0}")]
    DataSyntax(String),

    /// A malformed query (unknown column, unsortable order, bad
    /// comparison).
    #[error("programming error: {0}")]
    Programming(String),
}

pub type Result<T> = std::result::Result<T, BcpError>;
