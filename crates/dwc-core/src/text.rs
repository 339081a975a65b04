//! Label and unit text cleanup.
//!
//! Source labels contain a handful of non-ASCII characters (µ, °, ₂, Δ, the
//! heavy asterisk used in alarm text) plus embedded control characters.
//! Output formats are plain ASCII, so these are substituted up front.

/// Convert common non-ASCII characters to approximate ASCII equivalents
/// and control characters to spaces.
pub fn string_to_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\u{2731}' => out.push('*'),      // heavy asterisk
            '\u{b5}' => out.push('u'),        // micro sign
            '\u{b0}' => out.push_str("deg"),  // degree sign
            '\u{2082}' => out.push('2'),      // subscript two
            '\u{b2}' => out.push_str("^2"),   // superscript two
            '\u{394}' => out.push_str("Delta"),
            c if (c as u32) < 32 || c as u32 == 127 => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Sanitize a signal description for a WFDB header line.
pub fn sanitize_desc(desc: &str) -> String {
    let mut out = String::with_capacity(desc.len());
    for c in desc.chars() {
        match c {
            c if (' '..='\u{7e}').contains(&c) => out.push(c),
            '\u{2082}' => out.push('2'),
            '\u{394}' => out.push_str("Delta"),
            _ => out.push('_'),
        }
    }
    out
}

/// Sanitize a units string for a WFDB header line (no spaces allowed).
pub fn sanitize_units(units: &str) -> String {
    let mut out = String::with_capacity(units.len());
    for c in units.chars() {
        match c {
            c if c > ' ' && c < '\u{7f}' => out.push(c),
            '\u{b0}' => out.push_str("deg"),
            _ => out.push('_'),
        }
    }
    out
}

/// Strip control characters (including DEL) to spaces, leaving everything
/// else alone. Used for enum labels and values written to log files.
pub fn del_control(s: &str) -> String {
    s.chars()
        .map(|c| {
            if (c as u32) < 32 || c as u32 == 127 {
                ' '
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{sanitize_desc, sanitize_units, string_to_ascii};

    #[test]
    fn substitutes_common_symbols() {
        assert_eq!(string_to_ascii("\u{2731}\u{2731}\u{2731} VTach"), "*** VTach");
        assert_eq!(string_to_ascii("\u{b5}V"), "uV");
        assert_eq!(string_to_ascii("\u{b0}C"), "degC");
        assert_eq!(string_to_ascii("SpO\u{2082}"), "SpO2");
        assert_eq!(string_to_ascii("ml/m\u{b2}"), "ml/m^2");
        assert_eq!(string_to_ascii("\u{394}Temp"), "DeltaTemp");
    }

    #[test]
    fn desc_keeps_spaces_units_do_not() {
        assert_eq!(sanitize_desc("ECG II"), "ECG II");
        assert_eq!(sanitize_units("mm Hg"), "mm_Hg");
        assert_eq!(sanitize_units("\u{b0}F"), "degF");
    }
}
