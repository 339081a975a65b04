//! DWC timestamp handling.
//!
//! The export database stores calendar instants in the MS SQL text form
//! `YYYY-MM-DD HH:MM:SS.fff +ZZ:ZZ` (fractional seconds are mandatory, the
//! offset is written with a sign on the hour field only). [`DwcTimestamp`]
//! parses and re-emits that exact shape.
//!
//! Sequence numbers, not timestamps, are the reliable time axis in this
//! system; timestamps exist to anchor the sequence counter to the wall
//! clock and may jump when the monitoring system's clock is adjusted.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// DwcTimestamp
// ---------------------------------------------------------------------------

/// A calendar instant with a fixed UTC offset and microsecond precision.
///
/// Ordering, equality, and hashing are by instant (two timestamps in
/// different zones that name the same moment compare equal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DwcTimestamp(DateTime<FixedOffset>);

/// Error parsing a timestamp string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampParseError(pub String);

impl fmt::Display for TimestampParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed timestamp string: {:?}", self.0)
    }
}

impl std::error::Error for TimestampParseError {}

impl DwcTimestamp {
    /// Build a timestamp from calendar fields and a UTC offset in seconds.
    pub fn from_parts(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        micros: u32,
        offset_secs: i32,
    ) -> Option<DwcTimestamp> {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let time = NaiveTime::from_hms_micro_opt(hour, minute, second, micros)?;
        let offset = FixedOffset::east_opt(offset_secs)?;
        let local = NaiveDateTime::new(date, time);
        let utc = local - Duration::seconds(i64::from(offset_secs));
        Some(DwcTimestamp(DateTime::from_naive_utc_and_offset(
            utc, offset,
        )))
    }

    /// Build from an already-zoned chrono value.
    pub fn from_datetime(dt: DateTime<FixedOffset>) -> DwcTimestamp {
        DwcTimestamp(dt)
    }

    /// The sentinel "before all data" timestamp, 1800-01-01 00:00:00 UTC.
    pub fn very_old() -> DwcTimestamp {
        DwcTimestamp::from_parts(1800, 1, 1, 0, 0, 0, 0, 0)
            .unwrap_or_else(|| DwcTimestamp(Utc::now().fixed_offset()))
    }

    /// Signed difference `self - other` in whole milliseconds.
    pub fn delta_ms(&self, other: &DwcTimestamp) -> i64 {
        self.0.signed_duration_since(other.0).num_milliseconds()
    }

    /// This instant shifted forward by `ms` milliseconds (offset preserved).
    pub fn add_ms(&self, ms: i64) -> DwcTimestamp {
        DwcTimestamp(self.0 + Duration::milliseconds(ms))
    }

    /// The underlying chrono value.
    pub fn datetime(&self) -> DateTime<FixedOffset> {
        self.0
    }

    /// UTC offset in seconds east of Greenwich.
    pub fn offset_secs(&self) -> i32 {
        self.0.offset().local_minus_utc()
    }

    /// Re-express this instant in another fixed offset.
    pub fn with_offset_secs(&self, offset_secs: i32) -> Option<DwcTimestamp> {
        let offset = FixedOffset::east_opt(offset_secs)?;
        Some(DwcTimestamp(self.0.with_timezone(&offset)))
    }

    /// The local calendar date in this timestamp's own zone.
    pub fn local_date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    /// Record-directory datestamp, UTC: `YYYYMMDD-HHMM`.
    pub fn datestamp_utc(&self) -> String {
        self.0.with_timezone(&Utc).format("%Y%m%d-%H%M").to_string()
    }

    /// Compact UTC form used in the archive log files:
    /// `YYYYMMDDHHMMSSffffff` (always 20 digits).
    pub fn compact_utc(&self) -> String {
        self.0
            .with_timezone(&Utc)
            .format("%Y%m%d%H%M%S%6f")
            .to_string()
    }

    /// Parse the compact UTC form written by [`DwcTimestamp::compact_utc`].
    pub fn parse_compact_utc(s: &str) -> Result<DwcTimestamp, TimestampParseError> {
        let err = || TimestampParseError(s.to_owned());
        if s.len() < 20 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let num = |r: std::ops::Range<usize>| -> Result<u32, TimestampParseError> {
            s.get(r).and_then(|t| t.parse().ok()).ok_or_else(err)
        };
        let year: i32 = s.get(0..s.len() - 16).and_then(|t| t.parse().ok()).ok_or_else(err)?;
        let base = s.len() - 16;
        DwcTimestamp::from_parts(
            year,
            num(base..base + 2)?,
            num(base + 2..base + 4)?,
            num(base + 4..base + 6)?,
            num(base + 6..base + 8)?,
            num(base + 8..base + 10)?,
            num(base + 10..base + 16)?,
            0,
        )
        .ok_or_else(err)
    }
}

// ---------------------------------------------------------------------------
// Text form
// ---------------------------------------------------------------------------

impl FromStr for DwcTimestamp {
    type Err = TimestampParseError;

    /// Parse `YYYY-MM-DD HH:MM:SS.f+ ±HH:MM`.
    ///
    /// A leap second (`:60`) is silently compressed into the final
    /// millisecond of the preceding second; neither chrono nor the export
    /// itself can represent it, and the compression shows up (correctly) as
    /// a discontinuity in the record time map.
    fn from_str(s: &str) -> Result<DwcTimestamp, TimestampParseError> {
        let err = || TimestampParseError(s.to_owned());
        let mut parser = FieldParser { rest: s };

        let year = parser.digits().ok_or_else(err)?;
        parser.literal('-').ok_or_else(err)?;
        let month = parser.digits().ok_or_else(err)?;
        parser.literal('-').ok_or_else(err)?;
        let day = parser.digits().ok_or_else(err)?;
        if parser.spaces() == 0 {
            return Err(err());
        }
        let hour = parser.digits().ok_or_else(err)?;
        parser.literal(':').ok_or_else(err)?;
        let minute = parser.digits().ok_or_else(err)?;
        parser.literal(':').ok_or_else(err)?;
        let mut second = parser.digits().ok_or_else(err)?;
        parser.literal('.').ok_or_else(err)?;
        let frac = parser.digit_str().ok_or_else(err)?;
        let mut micros = parse_fraction_micros(frac).ok_or_else(err)?;
        parser.spaces();
        let sign: i32 = match parser.literal('+').or_else(|| parser.literal('-')) {
            Some('+') => 1,
            Some('-') => -1,
            _ => return Err(err()),
        };
        let offs_h = parser.digits().ok_or_else(err)?;
        parser.literal(':').ok_or_else(err)?;
        let offs_m = parser.digits().ok_or_else(err)?;
        if !parser.rest.is_empty() {
            return Err(err());
        }

        if second == 60 {
            second = 59;
            micros = 999_000 + micros / 1000;
        }

        let offset_secs = sign * (offs_h as i32 * 3600 + offs_m as i32 * 60);
        DwcTimestamp::from_parts(
            year as i32,
            month,
            day,
            hour,
            minute,
            second,
            micros,
            offset_secs,
        )
        .ok_or_else(err)
    }
}

impl fmt::Display for DwcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.0;
        let micros = t.timestamp_subsec_micros();
        let offs_min = self.offset_secs() / 60;
        let (sign, offs_abs) = if offs_min < 0 {
            ('-', -offs_min)
        } else {
            ('+', offs_min)
        };
        write!(
            f,
            "{}-{:02}-{:02} {:02}:{:02}:{:02}.",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        )?;
        if micros % 1000 == 0 {
            write!(f, "{:03}", micros / 1000)?;
        } else {
            write!(f, "{micros:06}")?;
        }
        write!(f, " {}{:02}:{:02}", sign, offs_abs / 60, offs_abs % 60)
    }
}

impl Serialize for DwcTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DwcTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DwcTimestamp, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

struct FieldParser<'a> {
    rest: &'a str,
}

impl<'a> FieldParser<'a> {
    fn digit_str(&mut self) -> Option<&'a str> {
        let n = self.rest.bytes().take_while(u8::is_ascii_digit).count();
        if n == 0 {
            return None;
        }
        let (digits, rest) = self.rest.split_at(n);
        self.rest = rest;
        Some(digits)
    }

    fn digits(&mut self) -> Option<u32> {
        self.digit_str()?.parse().ok()
    }

    fn literal(&mut self, c: char) -> Option<char> {
        self.rest = self.rest.strip_prefix(c)?;
        Some(c)
    }

    fn spaces(&mut self) -> usize {
        let n = self.rest.bytes().take_while(|b| b.is_ascii_whitespace()).count();
        self.rest = &self.rest[n..];
        n
    }
}

/// Convert a fractional-second digit string to rounded microseconds.
fn parse_fraction_micros(frac: &str) -> Option<u32> {
    // Equivalent to round(0.<frac> * 1e6), without going through floats.
    let mut value: u64 = 0;
    let mut scale: u64 = 1;
    for b in frac.bytes() {
        value = value * 10 + u64::from(b - b'0');
        scale *= 10;
        if scale >= 10_000_000_000 {
            break;
        }
    }
    while scale < 1_000_000 {
        value *= 10;
        scale *= 10;
    }
    let micros = (value * 1_000_000 + scale / 2) / scale;
    u32::try_from(micros).ok().filter(|m| *m < 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::DwcTimestamp;

    fn t(s: &str) -> DwcTimestamp {
        s.parse().expect("timestamp")
    }

    #[test]
    fn parses_and_reformats_millisecond_precision() {
        let ts = t("2017-03-01 12:00:00.000 +00:00");
        assert_eq!(ts.to_string(), "2017-03-01 12:00:00.000 +00:00");
    }

    #[test]
    fn keeps_microseconds_when_not_a_whole_millisecond() {
        let ts = t("2017-03-01 12:00:00.123456 -05:00");
        assert_eq!(ts.to_string(), "2017-03-01 12:00:00.123456 -05:00");
    }

    #[test]
    fn round_trips_through_display() {
        for s in [
            "2017-03-01 12:00:00.000 +00:00",
            "2015-11-05 12:53:27.120 +00:00",
            "2017-11-05 01:30:00.000 -05:00",
            "1994-06-30 23:59:59.999 +09:30",
        ] {
            assert_eq!(t(s).to_string(), s);
            assert_eq!(t(&t(s).to_string()), t(s));
        }
    }

    #[test]
    fn leap_second_compresses_into_previous_second() {
        let ts = t("2016-12-31 23:59:60.500 +00:00");
        assert_eq!(ts.datetime().timestamp_subsec_micros(), 999_500);
        assert_eq!(ts.to_string(), "2016-12-31 23:59:59.999500 +00:00");
    }

    #[test]
    fn compares_by_instant_across_offsets() {
        assert_eq!(
            t("2017-11-05 01:30:00.000 -05:00"),
            t("2017-11-05 06:30:00.000 +00:00")
        );
        assert!(t("2017-11-05 01:30:00.000 -05:00") < t("2017-11-05 01:30:00.001 -05:00"));
    }

    #[test]
    fn millisecond_deltas_and_offsets() {
        let a = t("2015-11-05 12:53:20.000 +00:00");
        let b = t("2015-11-05 12:53:27.120 +00:00");
        assert_eq!(b.delta_ms(&a), 7120);
        assert_eq!(a.add_ms(7120), b);
    }

    #[test]
    fn compact_utc_round_trip() {
        let ts = t("2017-03-01 12:00:00.250 -05:00");
        let compact = ts.compact_utc();
        assert_eq!(compact, "20170301170000250000");
        assert_eq!(DwcTimestamp::parse_compact_utc(&compact).unwrap(), ts);
    }

    #[test]
    fn serde_uses_the_text_form() {
        let ts = t("2017-03-01 12:00:00.000 +00:00");
        let json = serde_json::to_string(&ts).expect("serialize");
        assert_eq!(json, "\"2017-03-01 12:00:00.000 +00:00\"");
        let back: DwcTimestamp = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ts);
    }

    #[test]
    fn rejects_malformed_strings() {
        for s in [
            "",
            "2017-03-01",
            "2017-03-01 12:00:00 +00:00",
            "2017-03-01 12:00:00.000",
            "not a timestamp",
        ] {
            assert!(s.parse::<DwcTimestamp>().is_err(), "{s:?}");
        }
    }
}
