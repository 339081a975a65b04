//! Exact decimal values.
//!
//! Numeric columns in the export are decimals whose printed form matters:
//! the converter must write back exactly the digits the source produced.
//! [`DwcDecimal`] therefore stores the validated source text and only
//! converts to binary floating point at the few call sites that need
//! arithmetic (signal gain computation).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A decimal number kept in its exact source text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DwcDecimal(String);

/// Error validating a decimal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecimalParseError(pub String);

impl fmt::Display for DecimalParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed decimal: {:?}", self.0)
    }
}

impl std::error::Error for DecimalParseError {}

impl DwcDecimal {
    /// The verbatim source text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Approximate binary value, for arithmetic that tolerates rounding.
    pub fn to_f64(&self) -> Option<f64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for DwcDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DwcDecimal {
    type Err = DecimalParseError;

    /// Accepts `[+-]digits[.digits][(e|E)[+-]digits]` with at least one
    /// digit somewhere in the mantissa.
    fn from_str(s: &str) -> Result<DwcDecimal, DecimalParseError> {
        let err = || DecimalParseError(s.to_owned());
        let body = s.strip_prefix(['+', '-']).unwrap_or(s);
        let (mantissa, exponent) = match body.split_once(['e', 'E']) {
            Some((m, e)) => (m, Some(e)),
            None => (body, None),
        };
        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        if let Some(e) = exponent {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            if e.is_empty() || !e.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
        }
        Ok(DwcDecimal(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::DwcDecimal;

    #[test]
    fn preserves_source_text_exactly() {
        for s in ["98", "98.0", "98.00", "-0.5", "+1.25", "1E2", "7.5e-1"] {
            let d: DwcDecimal = s.parse().expect(s);
            assert_eq!(d.to_string(), s);
        }
    }

    #[test]
    fn distinct_texts_are_distinct_values() {
        let a: DwcDecimal = "1.0".parse().unwrap();
        let b: DwcDecimal = "1.00".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_non_decimals() {
        for s in ["", ".", "1.2.3", "abc", "1e", "--1"] {
            assert!(s.parse::<DwcDecimal>().is_err(), "{s:?}");
        }
    }
}
