//! WFDB file writing (and the header reading needed to join segments).
//!
//! Implements the subset of the WFDB format family this archive produces:
//! segment headers, multi-segment master/layout headers, and MIT-format
//! annotation files.

pub mod annot;
pub mod header;
pub mod join;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WfdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported header format: {0}")]
    Format(String),

    #[error("inconsistent segments: {0}")]
    Mismatch(String),
}

pub type Result<T> = std::result::Result<T, WfdbError>;

pub use annot::{Annotation, AnnotationType, Annotator};
pub use header::{SegmentHeader, SignalInfo};
pub use join::join_segments;
