//! Daylight-saving transition math for fall-back timestamp repair.
//!
//! The export host labels timestamps with a UTC offset, but during the
//! repeated hour of a fall-back transition some systems were observed to
//! stamp summer-time events with the winter offset. Given the governing
//! POSIX TZ rule (e.g. `EST5EDT,M3.2.0,M11.1.0`) and the patient-mapping
//! time, such timestamps can be detected and rewritten.
//!
//! A corrected timestamp is relabelled one hour past summer time (e.g.
//! `01:30:00 -05:00` that really occurred at `01:30:00 -04:00` becomes
//! `02:30:00 -03:00`) so corrected values remain recognizable.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::time::DwcTimestamp;

/// Minutes after the transition instant in which mislabelled timestamps
/// can occur (one repeated hour plus a little slack).
const AMBIGUOUS_WINDOW_MINUTES: i64 = 65;

// ---------------------------------------------------------------------------
// POSIX TZ rules
// ---------------------------------------------------------------------------

/// A `Mm.w.d[/time]` transition rule: day `d` (0 = Sunday) of week `w`
/// (1-5, 5 = last) of month `m`, at the given local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzRule {
    pub month: u32,
    pub week: u32,
    pub weekday: u32,
    /// Seconds after local midnight; POSIX default is 02:00:00.
    pub time_secs: i64,
}

impl TzRule {
    /// The calendar date this rule selects in a given year.
    pub fn date_in_year(&self, year: i32) -> Option<NaiveDate> {
        let first = NaiveDate::from_ymd_opt(year, self.month, 1)?;
        let first_dow = first.weekday().num_days_from_sunday();
        let offset = (self.weekday + 7 - first_dow) % 7;
        let mut day = 1 + offset + (self.week.min(5) - 1) * 7;
        let mut date = NaiveDate::from_ymd_opt(year, self.month, day);
        if self.week >= 5 {
            // "Week 5" means the last occurrence in the month.
            while date.is_none() && day > 7 {
                day -= 7;
                date = NaiveDate::from_ymd_opt(year, self.month, day);
            }
        }
        date
    }
}

/// A parsed POSIX TZ string with DST rules, such as
/// `EST5EDT,M3.2.0,M11.1.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixTz {
    pub std_abbr: String,
    /// Standard-time UTC offset, seconds east of Greenwich.
    pub std_offset_secs: i32,
    pub dst_abbr: String,
    /// Daylight-time UTC offset, seconds east of Greenwich.
    pub dst_offset_secs: i32,
    pub dst_start: TzRule,
    pub dst_end: TzRule,
}

/// Error parsing a POSIX TZ string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TzParseError(pub String);

impl fmt::Display for TzParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported TZ string: {:?}", self.0)
    }
}

impl std::error::Error for TzParseError {}

impl FromStr for PosixTz {
    fn from_str(s: &str) -> Result<PosixTz, TzParseError> {
        let err = || TzParseError(s.to_owned());
        let mut parts = s.split(',');
        let names = parts.next().ok_or_else(err)?;

        let (std_abbr, rest) = take_abbr(names);
        if std_abbr.is_empty() {
            return Err(err());
        }
        let (std_west_secs, rest) = take_offset(rest).ok_or_else(err)?;
        let (dst_abbr, rest) = take_abbr(rest);
        if dst_abbr.is_empty() {
            return Err(err());
        }
        // An explicit DST offset is rare; default is one hour ahead of std.
        let dst_west_secs = match take_offset(rest) {
            Some((offs, "")) => offs,
            None if rest.is_empty() => std_west_secs - 3600,
            _ => return Err(err()),
        };

        let dst_start = parse_rule(parts.next().ok_or_else(err)?).ok_or_else(err)?;
        let dst_end = parse_rule(parts.next().ok_or_else(err)?).ok_or_else(err)?;
        if parts.next().is_some() {
            return Err(err());
        }

        Ok(PosixTz {
            std_abbr: std_abbr.to_owned(),
            std_offset_secs: -std_west_secs,
            dst_abbr: dst_abbr.to_owned(),
            dst_offset_secs: -dst_west_secs,
            dst_start,
            dst_end,
        })
    }

    type Err = TzParseError;
}

fn take_abbr(s: &str) -> (&str, &str) {
    let n = s.bytes().take_while(u8::is_ascii_alphabetic).count();
    s.split_at(n)
}

/// Parse a POSIX offset (`[+-]hh[:mm[:ss]]`), returning seconds *west* of
/// Greenwich as POSIX defines it.
fn take_offset(s: &str) -> Option<(i32, &str)> {
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let n = s.bytes().take_while(u8::is_ascii_digit).count();
    if n == 0 {
        return None;
    }
    let (hours, mut rest) = s.split_at(n);
    let mut secs: i32 = hours.parse::<i32>().ok()? * 3600;
    for unit in [60, 1] {
        if let Some(r) = rest.strip_prefix(':') {
            let n = r.bytes().take_while(u8::is_ascii_digit).count();
            if n == 0 {
                return None;
            }
            let (v, r) = r.split_at(n);
            secs += v.parse::<i32>().ok()? * unit;
            rest = r;
        }
    }
    Some((sign * secs, rest))
}

fn parse_rule(s: &str) -> Option<TzRule> {
    let s = s.strip_prefix('M')?;
    let (spec, time) = match s.split_once('/') {
        Some((spec, time)) => (spec, Some(time)),
        None => (s, None),
    };
    let mut it = spec.split('.');
    let month: u32 = it.next()?.parse().ok()?;
    let week: u32 = it.next()?.parse().ok()?;
    let weekday: u32 = it.next()?.parse().ok()?;
    if it.next().is_some() || !(1..=12).contains(&month) || !(1..=5).contains(&week) || weekday > 6
    {
        return None;
    }
    let time_secs = match time {
        None => 2 * 3600,
        Some(t) => {
            let mut secs: i64 = 0;
            for (i, part) in t.split(':').enumerate() {
                if i > 2 {
                    return None;
                }
                secs += part.parse::<i64>().ok()? * [3600, 60, 1][i];
            }
            secs
        }
    };
    Some(TzRule {
        month,
        week,
        weekday,
        time_secs,
    })
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

impl PosixTz {
    /// Check whether `date` (a local calendar date) is a summer-to-winter
    /// transition date under this rule.
    ///
    /// Returns the transition instant as a pair: first labelled in local
    /// summer time, then in local winter time. Non-transition dates (and
    /// the spring-forward date) return `None`.
    pub fn get_transition_time(&self, date: NaiveDate) -> Option<(DwcTimestamp, DwcTimestamp)> {
        if self.dst_end.date_in_year(date.year())? != date {
            return None;
        }
        // The end-rule time is expressed in DST local time.
        let secs = self.dst_end.time_secs;
        let summer = DwcTimestamp::from_parts(
            date.year(),
            date.month(),
            date.day(),
            u32::try_from(secs / 3600).ok()?,
            u32::try_from((secs / 60) % 60).ok()?,
            u32::try_from(secs % 60).ok()?,
            0,
            self.dst_offset_secs,
        )?;
        let winter = summer.with_offset_secs(self.std_offset_secs)?;
        Some((summer, winter))
    }

    /// Repair a timestamp mislabelled during the fall-back repeated hour.
    ///
    /// `mapping_time` is the patient-mapping timestamp for the same
    /// mapping id; mapping times come from the export host clock and are
    /// not subject to the mislabelling. Returns the corrected timestamp,
    /// or `None` when the input needs no correction.
    pub fn fall_back_fix(
        &self,
        timestamp: &DwcTimestamp,
        mapping_time: &DwcTimestamp,
    ) -> Option<DwcTimestamp> {
        let date = timestamp.local_date();
        let (_, winter_tt) = [0, 1, -1].iter().find_map(|d| {
            let probe = if *d >= 0 {
                date.checked_add_days(chrono::Days::new(u64::try_from(*d).ok()?))?
            } else {
                date.checked_sub_days(chrono::Days::new(1))?
            };
            self.get_transition_time(probe)
        })?;

        let window_end = winter_tt.add_ms(AMBIGUOUS_WINDOW_MINUTES * 60_000);
        if *timestamp < winter_tt || *timestamp >= window_end {
            return None;
        }
        if timestamp.offset_secs() != self.std_offset_secs {
            // Not labelled as winter time, so nothing to repair.
            return None;
        }
        if timestamp.delta_ms(mapping_time) < 30 * 60_000 {
            // Close enough to the mapping time to be genuine winter time.
            return None;
        }
        timestamp
            .add_ms(-3_600_000)
            .with_offset_secs(self.dst_offset_secs + 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::PosixTz;
    use chrono::NaiveDate;

    fn eastern() -> PosixTz {
        "EST5EDT,M3.2.0,M11.1.0".parse().expect("tz")
    }

    #[test]
    fn parses_us_eastern_rule() {
        let tz = eastern();
        assert_eq!(tz.std_abbr, "EST");
        assert_eq!(tz.std_offset_secs, -5 * 3600);
        assert_eq!(tz.dst_abbr, "EDT");
        assert_eq!(tz.dst_offset_secs, -4 * 3600);
        assert_eq!((tz.dst_start.month, tz.dst_start.week, tz.dst_start.weekday), (3, 2, 0));
        assert_eq!((tz.dst_end.month, tz.dst_end.week, tz.dst_end.weekday), (11, 1, 0));
    }

    #[test]
    fn transition_pair_differs_by_one_hour_of_labeling() {
        let tz = eastern();
        let date = NaiveDate::from_ymd_opt(2017, 11, 5).unwrap();
        let (summer, winter) = tz.get_transition_time(date).expect("transition");
        assert_eq!(summer.to_string(), "2017-11-05 02:00:00.000 -04:00");
        assert_eq!(winter.to_string(), "2017-11-05 01:00:00.000 -05:00");
        assert_eq!(summer, winter);
    }

    #[test]
    fn old_style_rule_matches_documented_example() {
        let tz: PosixTz = "EST5EDT,M4.1.0,M10.5.0".parse().expect("tz");
        let date = NaiveDate::from_ymd_opt(2004, 10, 31).unwrap();
        let (summer, winter) = tz.get_transition_time(date).expect("transition");
        assert_eq!(summer.to_string(), "2004-10-31 02:00:00.000 -04:00");
        assert_eq!(winter.to_string(), "2004-10-31 01:00:00.000 -05:00");
    }

    #[test]
    fn non_transition_dates_are_none() {
        let tz = eastern();
        for d in [(2017, 11, 4), (2017, 11, 6), (2017, 3, 12), (2017, 7, 1)] {
            let date = NaiveDate::from_ymd_opt(d.0, d.1, d.2).unwrap();
            assert!(tz.get_transition_time(date).is_none(), "{date}");
        }
    }

    #[test]
    fn repairs_mislabelled_repeated_hour() {
        let tz = eastern();
        let ts = "2017-11-05 01:30:00.000 -05:00".parse().unwrap();
        let mapping = "2017-11-05 01:00:00.000 -05:00".parse().unwrap();
        let fixed = tz.fall_back_fix(&ts, &mapping).expect("corrected");
        assert_eq!(fixed.to_string(), "2017-11-05 02:30:00.000 -03:00");
    }

    #[test]
    fn keeps_timestamps_close_to_the_mapping_time() {
        let tz = eastern();
        let ts = "2017-11-05 01:20:00.000 -05:00".parse().unwrap();
        let mapping = "2017-11-05 01:00:00.000 -05:00".parse().unwrap();
        assert!(tz.fall_back_fix(&ts, &mapping).is_none());
    }

    #[test]
    fn keeps_timestamps_outside_the_window() {
        let tz = eastern();
        let mapping = "2017-11-05 00:00:00.000 -05:00".parse().unwrap();
        let before = "2017-11-05 00:59:59.000 -05:00".parse().unwrap();
        let after = "2017-11-05 02:06:00.000 -05:00".parse().unwrap();
        assert!(tz.fall_back_fix(&before, &mapping).is_none());
        assert!(tz.fall_back_fix(&after, &mapping).is_none());
    }

    #[test]
    fn keeps_summer_labelled_timestamps() {
        let tz = eastern();
        let ts = "2017-11-05 01:30:00.000 -04:00".parse().unwrap();
        let mapping = "2017-11-05 00:00:00.000 -05:00".parse().unwrap();
        assert!(tz.fall_back_fix(&ts, &mapping).is_none());
    }
}
