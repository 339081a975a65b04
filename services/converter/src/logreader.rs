//! Reading the record log files back, in time order.
//!
//! Log files interleave three kinds of lines: `S<seqnum>` lines, bare
//! decimal UTC timestamps (`YYYYMMDDHHMMSSffffff`), and data records.
//! A data record belongs to the most recent seqnum and timestamp lines
//! above it. Files are mostly sorted already (handlers write in arrival
//! order); readers need them fully sorted by (seqnum, timestamp, file
//! order).

use std::path::Path;

/// One data record with its effective seqnum and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub seqnum: i64,
    /// Compact UTC digits; zero when no timestamp line preceded the
    /// record (aperiodic entries keyed by seqnum only).
    pub timestamp: u128,
    pub line: Vec<u8>,
}

impl LogItem {
    /// Lines containing the corruption marker byte are garbage.
    pub fn is_corrupt(&self) -> bool {
        self.line.contains(&0x18)
    }
}

/// In-order reader over one log file.
pub struct ArchiveLogReader {
    items: Vec<LogItem>,
    missing: bool,
}

impl ArchiveLogReader {
    /// Open and parse a log file. With `allow_missing`, a nonexistent
    /// file reads as empty.
    pub fn open(path: &Path, allow_missing: bool) -> std::io::Result<ArchiveLogReader> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ArchiveLogReader {
                    items: Vec::new(),
                    missing: true,
                });
            }
            Err(e) => return Err(e),
        };

        let mut items = Vec::new();
        let mut seqnum: i64 = 0;
        let mut timestamp: u128 = 0;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            let trimmed = match line.last() {
                Some(b'\n') => &line[..line.len() - 1],
                _ => line,
            };
            if let Some(sn) = parse_seqnum_line(trimmed) {
                seqnum = sn;
            } else if let Some(ts) = parse_timestamp_line(trimmed) {
                timestamp = ts;
            } else {
                items.push(LogItem {
                    seqnum,
                    timestamp,
                    line: trimmed.to_vec(),
                });
            }
        }
        Ok(ArchiveLogReader {
            items,
            missing: false,
        })
    }

    pub fn missing(&self) -> bool {
        self.missing
    }

    /// Records in file order.
    pub fn unsorted_items(&self) -> impl Iterator<Item = &LogItem> {
        self.items.iter()
    }

    /// Records sorted by (seqnum, timestamp), stable within equal keys.
    pub fn sorted_items(&self) -> Vec<&LogItem> {
        let mut sorted: Vec<&LogItem> = self.items.iter().collect();
        sorted.sort_by_key(|item| (item.seqnum, item.timestamp));
        sorted
    }
}

fn parse_seqnum_line(line: &[u8]) -> Option<i64> {
    let rest = line.strip_prefix(b"S")?;
    if rest.is_empty() || !rest.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(rest).ok()?.parse().ok()
}

fn parse_timestamp_line(line: &[u8]) -> Option<u128> {
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(line).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::ArchiveLogReader;

    #[test]
    fn records_inherit_the_preceding_seqnum_and_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("_phi_numerics");
        std::fs::write(
            &path,
            b"S500\n20170301120000000000\nHR\t72\tbpm\nSpO2\t98\t%\nS600\nHR\t73\tbpm\n",
        )
        .expect("write");
        let reader = ArchiveLogReader::open(&path, false).expect("open");
        let items: Vec<_> = reader.unsorted_items().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].seqnum, 500);
        assert_eq!(items[0].timestamp, 20_170_301_120_000_000_000);
        assert_eq!(items[1].seqnum, 500);
        assert_eq!(items[2].seqnum, 600);
        assert_eq!(items[2].timestamp, 20_170_301_120_000_000_000);
        assert_eq!(items[2].line, b"HR\t73\tbpm");
    }

    #[test]
    fn sorted_items_reorder_out_of_order_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("_phi_enums");
        std::fs::write(&path, b"S600\nlate\nS500\nearly\nS600\nlate2\n").expect("write");
        let reader = ArchiveLogReader::open(&path, false).expect("open");
        let lines: Vec<&[u8]> = reader
            .sorted_items()
            .iter()
            .map(|i| i.line.as_slice())
            .collect();
        assert_eq!(lines, vec![b"early".as_slice(), b"late", b"late2"]);
    }

    #[test]
    fn corrupt_lines_are_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("_phi_alerts");
        std::fs::write(&path, b"S1\npartial\x18\r####\x18\nok\n").expect("write");
        let reader = ArchiveLogReader::open(&path, false).expect("open");
        let items: Vec<_> = reader.unsorted_items().collect();
        assert!(items[0].is_corrupt());
        assert!(!items[1].is_corrupt());
    }

    #[test]
    fn missing_file_reads_as_empty_when_allowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reader =
            ArchiveLogReader::open(&dir.path().join("_phi_aperiodics"), true).expect("open");
        assert!(reader.missing());
        assert_eq!(reader.unsorted_items().count(), 0);
        assert!(ArchiveLogReader::open(&dir.path().join("nope"), false).is_err());
    }
}
