//! Core domain types for the DWC patient-data converter.
//!
//! This crate holds everything shared between the flat-file database layer
//! and the conversion service: timestamps, message and attribute records,
//! dispatcher channels, the BCP wire encoding, and DST transition math.

pub mod attr;
pub mod bcp;
pub mod decimal;
pub mod dst;
pub mod message;
pub mod text;
pub mod time;

pub use attr::{EnumerationAttr, NumericAttr, WaveAttr};
pub use decimal::DwcDecimal;
pub use message::{Channel, Message, MessageKind, Origin};
pub use time::DwcTimestamp;
