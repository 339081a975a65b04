//! Numeric measurements: the live handler and the finalizer.
//!
//! Periodic numerics (heart rate and friends) are logged with both their
//! sequence number and timestamp, because the timestamp must later be
//! translated through the time map. Aperiodic numerics (NBP) are keyed by
//! sequence number alone. The finalizer merges both logs into one wide
//! CSV, one row per distinct observation time.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use dwc_core::text::string_to_ascii;
use dwc_core::{Channel, DwcTimestamp, Message};

use crate::archive::{Archive, ArchiveRecord};
use crate::db::DwcDb;
use crate::dispatch::{Decisions, Handler, HandlerError};
use crate::logreader::ArchiveLogReader;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct NumericValueHandler {
    archive: Rc<RefCell<Archive>>,
    db: Rc<RefCell<DwcDb>>,
    last_periodic: HashMap<PathBuf, (i64, DwcTimestamp)>,
    last_aperiodic: HashMap<PathBuf, i64>,
}

impl NumericValueHandler {
    pub fn new(archive: Rc<RefCell<Archive>>, db: Rc<RefCell<DwcDb>>) -> NumericValueHandler {
        NumericValueHandler {
            archive,
            db,
            last_periodic: HashMap::new(),
            last_aperiodic: HashMap::new(),
        }
    }
}

impl Handler for NumericValueHandler {
    fn name(&self) -> &'static str {
        "NumericValueHandler"
    }

    fn send_message(
        &mut self,
        _channel: &Channel,
        msg: &Message,
        decisions: &mut Decisions,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        let Message::NumericValue(m) = msg else {
            return Ok(());
        };
        decisions.nack();

        let attr = self
            .db
            .borrow_mut()
            .get_numeric_attr(m.numeric_id)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let record = self
            .archive
            .borrow_mut()
            .get_record(msg, ttl <= 0, &mut self.db.borrow_mut())?;
        let Some(record) = record else {
            return Ok(());
        };
        let mut record = record.borrow_mut();

        if record.dump_message(msg)? {
            decisions.ack();
            return Ok(());
        }

        let label = attr
            .sub_label
            .as_deref()
            .map(string_to_ascii)
            .ok_or_else(|| HandlerError::bug("numeric attribute has no label"))?;
        let units = attr.unit_label.as_deref().map(string_to_ascii).unwrap_or_default();
        let value = m.value.as_ref().map(ToString::to_string).unwrap_or_default();
        let key = record.path().to_path_buf();
        let sn = m.sequence_number;

        if attr.is_aperiodic.unwrap_or(false) {
            let logfile = record.open_log_file("_phi_aperiodics")?;
            if self.last_aperiodic.get(&key) != Some(&sn) {
                logfile.append(&format!("S{sn}"))?;
            }
            logfile.append(&format!("{label}\t{value}\t{units}"))?;
            self.last_aperiodic.insert(key, sn);
        } else {
            let ts = m.timestamp;
            let logfile = record.open_log_file("_phi_numerics")?;
            let last = self.last_periodic.get(&key);
            if last.map(|(s, _)| *s) != Some(sn) {
                logfile.append(&format!("S{sn}"))?;
            }
            if last.map(|(_, t)| *t) != Some(ts) {
                logfile.append(&ts.compact_utc())?;
            }
            logfile.append(&format!("{label}\t{value}\t{units}"))?;
            self.last_periodic.insert(key, (sn, ts));
        }
        decisions.ack();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HandlerError> {
        self.archive.borrow_mut().flush()
    }
}

// ---------------------------------------------------------------------------
// Finalizer
// ---------------------------------------------------------------------------

/// Look-ahead bound when translating a periodic timestamp to a sequence
/// number: an observation attached to sequence number N cannot have
/// happened after N + 5120.
pub const SEQNUM_LOOKAHEAD_MS: i64 = 5120;

pub struct NumericValueFinalizer {
    periodic: ArchiveLogReader,
    aperiodic: ArchiveLogReader,
    /// All (label, units) columns with at least one non-null value.
    columns: BTreeSet<(Vec<u8>, Vec<u8>)>,
}

impl NumericValueFinalizer {
    /// First pass: enumerate columns and feed every periodic timestamp
    /// to the time map.
    pub fn new(record: &mut ArchiveRecord) -> std::io::Result<NumericValueFinalizer> {
        let periodic = ArchiveLogReader::open(&record.path().join("_phi_numerics"), true)?;
        let aperiodic = ArchiveLogReader::open(&record.path().join("_phi_aperiodics"), true)?;
        let mut columns = BTreeSet::new();

        for item in periodic.unsorted_items() {
            if let Ok(ts) = DwcTimestamp::parse_compact_utc(&item.timestamp.to_string()) {
                record.time_map.add_time(&ts);
            }
            if !item.is_corrupt() {
                if let Some(col) = column_of(&item.line) {
                    columns.insert(col);
                }
            }
        }
        for item in aperiodic.unsorted_items() {
            if !item.is_corrupt() {
                if let Some(col) = column_of(&item.line) {
                    columns.insert(col);
                }
            }
        }
        Ok(NumericValueFinalizer {
            periodic,
            aperiodic,
            columns,
        })
    }

    /// Second pass: merge both logs in time order into `numerics.csv`.
    pub fn finalize(&self, record: &mut ArchiveRecord) -> std::io::Result<()> {
        if self.columns.is_empty() {
            return Ok(());
        }
        let mut sn0 = record.seqnum0();
        let column_index: BTreeMap<&(Vec<u8>, Vec<u8>), usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c, i + 1))
            .collect();

        let mut merged: Vec<&crate::logreader::LogItem> = self
            .periodic
            .sorted_items()
            .into_iter()
            .chain(self.aperiodic.sorted_items())
            .collect();
        merged.sort_by_key(|item| (item.seqnum, item.timestamp));

        let csv_path = record.path().join("numerics.csv");
        let mut out: Vec<u8> = Vec::new();

        // The header doubles as the initial "previous row": the first
        // data row always has a different time cell, which writes the
        // header out.
        let mut row: Vec<Vec<u8>> = Vec::with_capacity(self.columns.len() + 1);
        row.push(b"\"time\"".to_vec());
        for (name, units) in &self.columns {
            let units: &[u8] = if units.is_empty() { b"NU" } else { units };
            let mut desc = name.clone();
            desc.extend_from_slice(b" [");
            desc.extend_from_slice(units);
            desc.push(b']');
            let mut cell = Vec::with_capacity(desc.len() + 2);
            cell.push(b'"');
            for b in desc {
                if b == b'"' {
                    cell.extend_from_slice(b"\"\"");
                } else {
                    cell.push(b);
                }
            }
            cell.push(b'"');
            row.push(cell);
        }

        let mut cur_key: Option<(i64, u128)> = None;
        let mut cur_time: Vec<u8> = Vec::new();

        for item in merged {
            if item.is_corrupt() {
                continue;
            }
            let Some((col, value)) = cell_of(&item.line) else {
                continue;
            };
            let Some(&col_idx) = column_index.get(&col) else {
                continue;
            };

            if cur_key != Some((item.seqnum, item.timestamp)) {
                let obs_sn = if item.timestamp == 0 {
                    // Aperiodics observe at their sequence number.
                    item.seqnum
                } else {
                    match DwcTimestamp::parse_compact_utc(&item.timestamp.to_string()) {
                        Ok(ts) => record
                            .time_map
                            .get_seqnum(&ts, Some(item.seqnum + SEQNUM_LOOKAHEAD_MS))
                            .unwrap_or(item.seqnum),
                        Err(_) => item.seqnum,
                    }
                };
                if sn0.is_none() {
                    sn0 = Some(obs_sn);
                }
                cur_time = (obs_sn - sn0.unwrap_or(obs_sn)).to_string().into_bytes();
                cur_key = Some((item.seqnum, item.timestamp));
            }

            if row[0] != cur_time {
                write_csv_row(&mut out, &row);
                row = vec![Vec::new(); self.columns.len() + 1];
                row[0] = cur_time.clone();
            }
            row[col_idx] = trim_value(value);
        }
        write_csv_row(&mut out, &row);

        std::fs::write(&csv_path, out)?;
        Ok(())
    }
}

/// Split a `label \t value \t units` line; `None` for nulls and malformed
/// lines.
fn cell_of(line: &[u8]) -> Option<((Vec<u8>, Vec<u8>), &[u8])> {
    let mut parts = line.splitn(3, |b| *b == b'\t');
    let label = parts.next()?;
    let value = parts.next()?;
    let units = parts.next()?;
    if value.is_empty() {
        return None;
    }
    Some(((label.to_vec(), units.to_vec()), value))
}

fn column_of(line: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    cell_of(line).map(|(col, _)| col)
}

/// Trim a decimal's trailing fractional zeros (`98.00` -> `98`,
/// `7.50` -> `7.5`); integral values pass through untouched.
fn trim_value(value: &[u8]) -> Vec<u8> {
    if !value.contains(&b'.') {
        return value.to_vec();
    }
    let mut v = value.to_vec();
    while v.last() == Some(&b'0') {
        v.pop();
    }
    if v.last() == Some(&b'.') {
        v.pop();
    }
    v
}

fn write_csv_row(out: &mut Vec<u8>, row: &[Vec<u8>]) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(cell);
    }
    out.push(b'\n');
}
