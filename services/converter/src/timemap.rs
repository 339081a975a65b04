//! The per-record map between sequence numbers and wall-clock time.
//!
//! Sequence numbers measure time reliably; wall-clock timestamps do not
//! (the monitoring system's clock gets adjusted). The map is a sorted
//! list of disjoint spans `[start_seq, end_seq, base]` inside which
//! `wallclock(seq) = base + seq` milliseconds exactly. Wave messages
//! provide reference points (their sequence number and timestamp arrive
//! together); numerics, enums, and alerts provide non-reference
//! observations that only help narrow down where between two spans a
//! clock adjustment happened.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use dwc_core::DwcTimestamp;
use tracing::warn;

/// Two same-base reference points closer than this (in sequence-counter
/// milliseconds) are assumed to belong to one span: the clock cannot have
/// been adjusted away and back in between.
const MERGE_WINDOW_MS: i64 = 30_000;

#[derive(Debug, Clone)]
pub struct Span {
    pub start: i64,
    pub end: i64,
    pub base: DwcTimestamp,
    /// Non-reference timestamps observed before this span's start.
    pending: BTreeSet<DwcTimestamp>,
}

#[derive(Debug)]
pub struct TimeMap {
    entries: Vec<Span>,
    record_id: String,
}

impl TimeMap {
    pub fn new(record_id: impl Into<String>) -> TimeMap {
        TimeMap {
            entries: Vec::new(),
            record_id: record_id.into(),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load the map from `<dir>/<name>` (CSV `start,end,base`). A missing
    /// file is an empty map.
    pub fn read(&mut self, dir: &Path, name: &str) -> std::io::Result<()> {
        let text = match std::fs::read_to_string(dir.join(name)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for line in text.lines() {
            let mut fields = line.splitn(3, ',');
            let (Some(start), Some(end), Some(base)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(start), Ok(end), Ok(base)) = (
                start.parse::<i64>(),
                end.parse::<i64>(),
                base.parse::<DwcTimestamp>(),
            ) else {
                continue;
            };
            self.entries.push(Span {
                start,
                end,
                base,
                pending: BTreeSet::new(),
            });
        }
        self.entries.sort_by_key(|e| (e.start, e.end));
        Ok(())
    }

    /// Write the map to `<dir>/<name>` atomically.
    pub fn write(&self, dir: &Path, name: &str) -> std::io::Result<()> {
        let tmp = dir.join(format!("_{name}.tmp"));
        let mut f = std::fs::File::create(&tmp)?;
        for e in &self.entries {
            writeln!(f, "{},{},{}", e.start, e.end, e.base)?;
        }
        f.sync_data()?;
        drop(f);
        std::fs::rename(&tmp, dir.join(name))
    }

    // -----------------------------------------------------------------------
    // Building the map
    // -----------------------------------------------------------------------

    /// Record a reference point: the wall clock read `time` exactly at
    /// `seqnum`.
    pub fn set_time(&mut self, seqnum: i64, time: &DwcTimestamp) {
        let base = time.add_ms(-seqnum);

        // First span that starts at or after seqnum.
        let i = self.entries.partition_point(|e| e.start < seqnum);
        let prev = i.checked_sub(1);

        let in_prev = prev.is_some_and(|p| seqnum <= self.entries[p].end);
        let at_next = i < self.entries.len() && seqnum >= self.entries[i].start;

        if in_prev {
            let p = &self.entries[prev.expect("checked")];
            if base != p.base {
                warn!("conflicting timestamps at {seqnum} in {}", self.record_id);
            }
        } else if at_next {
            let n = &self.entries[i];
            if base != n.base {
                warn!("conflicting timestamps at {seqnum} in {}", self.record_id);
            }
        } else if prev.is_some_and(|p| {
            self.entries[p].base == base && seqnum - self.entries[p].end < MERGE_WINDOW_MS
        }) {
            let p = prev.expect("checked");
            self.entries[p].end = seqnum;
            if i < self.entries.len()
                && self.entries[i].base == base
                && self.entries[i].start - seqnum < MERGE_WINDOW_MS
            {
                self.entries[i].start = self.entries[p].start;
                self.entries.remove(p);
            }
        } else if i < self.entries.len()
            && self.entries[i].base == base
            && self.entries[i].start - seqnum < MERGE_WINDOW_MS
        {
            self.entries[i].start = seqnum;
        } else {
            self.entries.insert(
                i,
                Span {
                    start: seqnum,
                    end: seqnum,
                    base,
                    pending: BTreeSet::new(),
                },
            );
        }
    }

    /// Record a non-reference observation: the wall clock read `time` at
    /// some unknown sequence number. Must be called after all reference
    /// points are in.
    pub fn add_time(&mut self, time: &DwcTimestamp) {
        for e in &mut self.entries {
            let start = e.base.add_ms(e.start);
            if *time < start {
                e.pending.insert(*time);
                return;
            }
            let end = e.base.add_ms(e.end);
            if *time <= end {
                return;
            }
        }
    }

    /// Refine the map: for each inter-span gap with pending observations,
    /// place the clock adjustment at the largest empty interval and turn
    /// the observations on either side into reference points.
    pub fn resolve_gaps(&mut self) {
        let mut i = 1;
        while i < self.entries.len() {
            let pending = std::mem::take(&mut self.entries[i].pending);
            if !pending.is_empty() {
                let p = &self.entries[i - 1];
                let n = &self.entries[i];
                let gapstart = p.base.add_ms(p.end);
                let gapend = n.base.add_ms(n.start);
                let p_base = p.base;
                let n_base = n.base;

                let mut points: BTreeSet<DwcTimestamp> = pending;
                points.insert(gapstart);
                points.insert(gapend);

                // The adjustment most likely sits in the longest stretch
                // with no observed events.
                let mut best: (i64, DwcTimestamp) = (0, gapstart);
                let mut iter = points.iter();
                if let Some(mut prev) = iter.next().copied() {
                    for cur in iter {
                        let d = cur.delta_ms(&prev);
                        if (d, prev) > best {
                            best = (d, prev);
                        }
                        prev = *cur;
                    }
                }
                let tbefore = best.1;
                let tafter = tbefore.add_ms(best.0);
                let snp = tbefore.delta_ms(&p_base);
                let snn = tafter.delta_ms(&n_base);
                self.set_time(snp, &tbefore);
                self.set_time(snn, &tafter);
            }
            i += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Guess the sequence number at which the wall clock displayed
    /// `time`. `limit` is the latest admissible value (inclusive); events
    /// attached to message sequence number N cannot be later than N + 5120.
    pub fn get_seqnum(&self, time: &DwcTimestamp, limit: Option<i64>) -> Option<i64> {
        if self.entries.is_empty() {
            return None;
        }
        let limit = limit.unwrap_or(self.entries[self.entries.len() - 1].end);

        // Latest instant (within limit) at which the clock actually
        // displayed this value.
        let mut possible: Vec<(i64, i64)> = Vec::with_capacity(self.entries.len());
        let mut best_known = None;
        for e in &self.entries {
            let sn = time.delta_ms(&e.base);
            possible.push((sn, e.end));
            if e.start <= sn && sn <= e.end && sn <= limit {
                best_known = Some(sn);
            }
        }
        if best_known.is_some() {
            return best_known;
        }

        // Else the earliest span for which the timestamp is not yet past.
        for (sn, span_end) in &possible {
            if sn <= span_end {
                return Some(*sn);
            }
        }

        // Else it is in the future: extrapolate from the last span.
        possible.last().map(|(sn, _)| *sn)
    }

    /// Guess the wall-clock time at a sequence number, using the nearest
    /// span.
    pub fn get_time(&self, seqnum: i64) -> Option<DwcTimestamp> {
        let mut best: Option<(i64, DwcTimestamp)> = None;
        for e in &self.entries {
            let delta = (e.start - seqnum).max(seqnum - e.end);
            if best.is_none_or(|(d, _)| delta < d) {
                best = Some((delta, e.base.add_ms(seqnum)));
            }
        }
        best.map(|(_, t)| t)
    }
}

#[cfg(test)]
mod tests {
    use super::TimeMap;
    use dwc_core::DwcTimestamp;

    fn t(s: &str) -> DwcTimestamp {
        s.parse().expect("timestamp")
    }

    #[test]
    fn nearby_references_with_one_base_merge_into_a_span() {
        let mut map = TimeMap::new("rec");
        let base = t("2015-11-05 12:53:20.000 +00:00");
        map.set_time(0, &base);
        map.set_time(5000, &base.add_ms(5000));
        map.set_time(25000, &base.add_ms(25000));
        assert_eq!(map.spans().len(), 1);
        assert_eq!(map.spans()[0].start, 0);
        assert_eq!(map.spans()[0].end, 25000);
    }

    #[test]
    fn distant_references_start_a_new_span() {
        let mut map = TimeMap::new("rec");
        let base = t("2015-11-05 12:53:20.000 +00:00");
        map.set_time(0, &base);
        map.set_time(40_000, &base.add_ms(40_000));
        assert_eq!(map.spans().len(), 2);
    }

    #[test]
    fn clock_adjustment_splits_the_map() {
        let mut map = TimeMap::new("rec");
        let base = t("2015-11-05 12:53:20.000 +00:00");
        map.set_time(0, &base);
        // Clock stepped forward two seconds.
        map.set_time(5120, &base.add_ms(5120 + 2000));
        assert_eq!(map.spans().len(), 2);
        assert_eq!(map.get_time(0), Some(base));
        assert_eq!(map.get_time(5120), Some(base.add_ms(7120)));
    }

    #[test]
    fn resolve_gaps_places_the_adjustment_at_the_largest_quiet_interval() {
        // References: seq 0 -> 12:53:20.000, seq 5120 -> 12:53:27.120
        // (a two-second step somewhere in between). Observations at
        // 12:53:21.900 and 12:53:23.800 pin the step to after 23.800,
        // so those observations resolve to seqnums 1900 and 3800.
        let mut map = TimeMap::new("rec");
        map.set_time(0, &t("2015-11-05 12:53:20.000 +00:00"));
        map.set_time(5120, &t("2015-11-05 12:53:27.120 +00:00"));
        map.add_time(&t("2015-11-05 12:53:21.900 +00:00"));
        map.add_time(&t("2015-11-05 12:53:23.800 +00:00"));
        map.resolve_gaps();

        assert_eq!(
            map.get_seqnum(&t("2015-11-05 12:53:21.900 +00:00"), None),
            Some(1900)
        );
        assert_eq!(
            map.get_seqnum(&t("2015-11-05 12:53:23.800 +00:00"), None),
            Some(3800)
        );
        assert_eq!(
            map.get_seqnum(&t("2015-11-05 12:53:27.120 +00:00"), None),
            Some(5120)
        );
    }

    #[test]
    fn resolved_map_is_monotone() {
        let mut map = TimeMap::new("rec");
        map.set_time(0, &t("2015-11-05 12:53:20.000 +00:00"));
        map.set_time(5120, &t("2015-11-05 12:53:27.120 +00:00"));
        map.add_time(&t("2015-11-05 12:53:21.900 +00:00"));
        map.add_time(&t("2015-11-05 12:53:23.800 +00:00"));
        map.resolve_gaps();

        let times = [
            "2015-11-05 12:53:20.000 +00:00",
            "2015-11-05 12:53:21.900 +00:00",
            "2015-11-05 12:53:23.800 +00:00",
            "2015-11-05 12:53:27.120 +00:00",
            "2015-11-05 12:53:30.000 +00:00",
        ];
        let mut prev = None;
        for s in times {
            let sn = map.get_seqnum(&t(s), None).expect("seqnum");
            if let Some(p) = prev {
                assert!(sn >= p, "{s} resolved to {sn} < {p}");
            }
            prev = Some(sn);
        }
    }

    #[test]
    fn round_trip_inside_a_span() {
        let mut map = TimeMap::new("rec");
        let base = t("2015-11-05 12:53:20.000 +00:00");
        map.set_time(1000, &base.add_ms(1000));
        map.set_time(9000, &base.add_ms(9000));
        let inside = base.add_ms(4321);
        let sn = map.get_seqnum(&inside, None).expect("seqnum");
        assert_eq!(map.get_time(sn), Some(inside));
    }

    #[test]
    fn get_seqnum_prefers_the_latest_limit_compatible_span() {
        let mut map = TimeMap::new("rec");
        let base = t("2015-11-05 12:00:00.000 +00:00");
        map.set_time(0, &base);
        map.set_time(10_000, &base.add_ms(10_000));
        // The wall clock stepped back five seconds, so times between
        // 12:00:07 and 12:00:10 were displayed twice.
        map.set_time(12_000, &base.add_ms(12_000 - 5_000));
        map.set_time(22_000, &base.add_ms(22_000 - 5_000));

        let ambiguous = base.add_ms(9_000);
        // With a tight limit only the first display qualifies.
        assert_eq!(map.get_seqnum(&ambiguous, Some(9_000)), Some(9_000));
        // Unconstrained, the later display wins.
        assert_eq!(map.get_seqnum(&ambiguous, None), Some(14_000));
    }

    #[test]
    fn persists_spans_but_not_pending_observations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut map = TimeMap::new("rec");
        map.set_time(0, &t("2015-11-05 12:53:20.000 +00:00"));
        map.set_time(5120, &t("2015-11-05 12:53:27.120 +00:00"));
        map.add_time(&t("2015-11-05 12:53:21.900 +00:00"));
        map.write(dir.path(), "_phi_time_map").expect("write");

        let mut loaded = TimeMap::new("rec");
        loaded.read(dir.path(), "_phi_time_map").expect("read");
        assert_eq!(loaded.spans().len(), 2);
        assert_eq!(loaded.spans()[0].start, 0);
        assert_eq!(loaded.spans()[1].start, 5120);
        assert_eq!(
            loaded.spans()[1].base,
            t("2015-11-05 12:53:27.120 +00:00").add_ms(-5120)
        );
    }
}
