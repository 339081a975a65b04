//! Column types and values.

use std::cmp::Ordering;

use dwc_core::{DwcDecimal, DwcTimestamp};
use uuid::Uuid;

use crate::error::BcpError;

/// The declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Binary,
    String,
    Number,
    DateTime,
    Integer,
    Boolean,
    Uuid,
}

/// A single cell, as decoded from a data file or supplied as a query
/// parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bytes(Vec<u8>),
    Str(String),
    Number(DwcDecimal),
    Time(DwcTimestamp),
    Int(i64),
    Bool(bool),
    Uuid(Uuid),
}

impl ColumnType {
    /// Decode a raw field. An empty field is a null for every type.
    pub fn decode(self, raw: &[u8]) -> Result<Value, BcpError> {
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        let text = || {
            std::str::from_utf8(raw)
                .map_err(|e| BcpError::DataSyntax(format!("invalid UTF-8: {e}")))
        };
        match self {
            ColumnType::Binary => Ok(Value::Bytes(raw.to_vec())),
            ColumnType::String => {
                if raw == b"\0" {
                    // A single NUL marks an empty (but non-null) string.
                    Ok(Value::Str(String::new()))
                } else {
                    Ok(Value::Str(text()?.to_owned()))
                }
            }
            ColumnType::Number => {
                let d: DwcDecimal = text()?
                    .parse()
                    .map_err(|e| BcpError::DataSyntax(format!("{e}")))?;
                Ok(Value::Number(d))
            }
            ColumnType::DateTime => {
                let t: DwcTimestamp = text()?
                    .parse()
                    .map_err(|e| BcpError::DataSyntax(format!("{e}")))?;
                Ok(Value::Time(t))
            }
            ColumnType::Integer => {
                let n: i64 = text()?
                    .parse()
                    .map_err(|e| BcpError::DataSyntax(format!("bad integer {:?}: {e}", text())))?;
                Ok(Value::Int(n))
            }
            ColumnType::Boolean => {
                let n: i64 = text()?
                    .parse()
                    .map_err(|e| BcpError::DataSyntax(format!("bad boolean: {e}")))?;
                Ok(Value::Bool(n != 0))
            }
            ColumnType::Uuid => {
                let u = Uuid::parse_str(text()?)
                    .map_err(|e| BcpError::DataSyntax(format!("bad UUID: {e}")))?;
                Ok(Value::Uuid(u))
            }
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Compare two values of the same type. Nulls and mismatched types
    /// are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Number(b)) => a.to_f64().partial_cmp(&b.to_f64()),
            _ => None,
        }
    }

    /// A canonical string key for indexed lookup.
    pub fn index_key(&self) -> Option<String> {
        match self {
            Value::Uuid(u) => Some(u.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
