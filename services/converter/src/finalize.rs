//! Record finalization: one-shot transformation of the log files into
//! the canonical research artifacts.
//!
//! Order is fixed (waves, numerics, enums, alerts) because the later
//! finalizers translate wall-clock timestamps through the time map,
//! which is only fully refined once every observation has been fed in
//! and the gaps resolved.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::info;
use wfdb_io::{join_segments, Annotation, AnnotationType, Annotator};

use crate::alerts::AlertFinalizer;
use crate::archive::ArchiveRecord;
use crate::dispatch::HandlerError;
use crate::enums::EnumerationValueFinalizer;
use crate::logreader::ArchiveLogReader;
use crate::numerics::NumericValueFinalizer;
use crate::waves::WaveOutputInfo;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Handler(#[from] HandlerError),

    #[error("WFDB error: {0}")]
    Wfdb(#[from] wfdb_io::WfdbError),

    #[error("{0}")]
    BadRecord(String),
}

fn segment_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(-?\d+)\.hea$").expect("static regex"))
}

/// Finalize the record directory at `path`. Idempotent: an already
/// finalized record is left alone, so a restarted worker can simply run
/// again.
pub fn finalize_record(path: &Path) -> Result<(), FinalizeError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FinalizeError::BadRecord(format!("{}: no directory name", path.display())))?;
    let mut parts = name.splitn(3, '_');
    let (Some(servername), Some(record_id), Some(datestamp)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(FinalizeError::BadRecord(format!(
            "{name}: not a record directory name"
        )));
    };

    let mut record = ArchiveRecord::new(path, servername, record_id, datestamp, false)?;
    if record.is_finalized() {
        return Ok(());
    }
    info!("finalizing {name}");

    if !record.is_dump() {
        // 1. Waves: close the open segment, join segments, digest the
        //    quality logs.
        finalize_waves(&mut record)?;

        // 2-4. The remaining finalizers scan first (feeding the time
        //    map), then the map is refined once, then they emit.
        let numerics = NumericValueFinalizer::new(&mut record)?;
        let enums = EnumerationValueFinalizer::new(&mut record)?;
        let alerts = AlertFinalizer::new(&mut record)?;
        record.time_map.resolve_gaps();

        numerics.finalize(&mut record)?;
        enums.finalize(&mut record)?;
        alerts.finalize(&mut record)?;
    }

    record.set_property(&["finalized"], serde_json::json!(1));
    record.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Waves
// ---------------------------------------------------------------------------

/// Close the pending segment, join all segments under a master header,
/// and turn the `_wq_` quality logs into `waves.wq` annotations.
pub fn finalize_waves(record: &mut ArchiveRecord) -> Result<(), FinalizeError> {
    let mut info = WaveOutputInfo::load(record)?;
    info.close_segment(record)?;

    let mut segments: Vec<(i64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(record.path())? {
        let entry = entry?;
        let Some(fname) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some(caps) = segment_header_re().captures(&fname) {
            if let Ok(start) = caps[1].parse::<i64>() {
                segments.push((start, entry.path()));
            }
        }
    }
    segments.sort();

    if !segments.is_empty() {
        let headers: Vec<PathBuf> = segments.into_iter().map(|(_, p)| p).collect();
        join_segments(
            &record.path().join("waves.hea"),
            &headers,
            "_layout",
            true,
        )?;
    }

    finalize_quality(record)?;
    Ok(())
}

/// Aggregate the per-signal quality logs into one annotation stream:
/// a single `PACESP` per distinct paced-pulse time, and `NOTE`
/// annotations bracketing the time ranges where any signal is invalid
/// (`(i` / `i)`) or unavailable (`(u` / `u)`).
fn finalize_quality(record: &mut ArchiveRecord) -> Result<(), FinalizeError> {
    let mut paced: std::collections::BTreeSet<i64> = std::collections::BTreeSet::new();
    // (time, delta) edges for the reference counters.
    let mut invalid_edges: Vec<(i64, i64)> = Vec::new();
    let mut unavailable_edges: Vec<(i64, i64)> = Vec::new();

    for entry in std::fs::read_dir(record.path())? {
        let entry = entry?;
        let Some(fname) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !fname.starts_with("_wq_") {
            continue;
        }
        let reader = ArchiveLogReader::open(&entry.path(), false)?;
        for item in reader.unsorted_items() {
            if item.is_corrupt() {
                continue;
            }
            let line = &item.line;
            match line.first() {
                Some(b'P') => {
                    if let Some(t) = parse_i64(&line[1..]) {
                        paced.insert(t);
                    }
                }
                Some(b'I') => {
                    if let Some((a, b)) = parse_pair(&line[1..]) {
                        invalid_edges.push((a, 1));
                        invalid_edges.push((b, -1));
                    }
                }
                Some(b'U') => {
                    if let Some((a, b)) = parse_pair(&line[1..]) {
                        unavailable_edges.push((a, 1));
                        unavailable_edges.push((b, -1));
                    }
                }
                _ => {}
            }
        }
    }

    // Counter transitions between zero and non-zero become bracketing
    // notes.
    let mut events: Vec<(i64, usize, &'static [u8])> = Vec::new();
    for (edges, open, close) in [
        (&mut invalid_edges, b"(i".as_slice(), b"i)".as_slice()),
        (&mut unavailable_edges, b"(u".as_slice(), b"u)".as_slice()),
    ] {
        edges.sort_unstable();
        let mut count = 0i64;
        for &(t, delta) in edges.iter() {
            let before = count;
            count += delta;
            if before == 0 && count > 0 {
                events.push((t, events.len(), open));
            } else if before > 0 && count == 0 {
                events.push((t, events.len(), close));
            }
        }
    }
    for &t in &paced {
        events.push((t, events.len(), b""));
    }
    if events.is_empty() {
        return Ok(());
    }
    events.sort_by_key(|(t, order, _)| (*t, *order));

    let path = record.path().join("waves.wq");
    let mut anns = Annotator::create(&path, Some(1000.0))?;
    for (t, _, aux) in events {
        if aux.is_empty() {
            anns.put(&Annotation {
                time: t,
                anntyp: AnnotationType::PACESP,
                subtyp: 0,
                chan: 255,
                num: 0,
                aux: None,
            })?;
        } else {
            anns.put(&Annotation {
                time: t,
                anntyp: AnnotationType::NOTE,
                subtyp: 0,
                chan: 255,
                num: 0,
                aux: Some(aux.to_vec()),
            })?;
        }
    }
    anns.close()?;
    Ok(())
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

fn parse_pair(bytes: &[u8]) -> Option<(i64, i64)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut parts = text.split_whitespace();
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    Some((a, b))
}
