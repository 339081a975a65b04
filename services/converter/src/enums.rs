//! Enumeration values: beat labels and rhythm statements.
//!
//! The live handler appends raw enum observations to `_phi_enums`; the
//! finalizer turns the `Annot` stream into WFDB beat annotations in
//! `waves.beat`, translating each observation's wall-clock time through
//! the record time map.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use dwc_core::text::del_control;
use dwc_core::{Channel, DwcTimestamp, Message};
use wfdb_io::{Annotation, AnnotationType, Annotator};

use crate::archive::{Archive, ArchiveRecord};
use crate::db::DwcDb;
use crate::dispatch::{Decisions, Handler, HandlerError};
use crate::logreader::ArchiveLogReader;
use crate::numerics::SEQNUM_LOOKAHEAD_MS;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct EnumerationValueHandler {
    archive: Rc<RefCell<Archive>>,
    db: Rc<RefCell<DwcDb>>,
    last_event: HashMap<PathBuf, (i64, DwcTimestamp)>,
}

impl EnumerationValueHandler {
    pub fn new(archive: Rc<RefCell<Archive>>, db: Rc<RefCell<DwcDb>>) -> EnumerationValueHandler {
        EnumerationValueHandler {
            archive,
            db,
            last_event: HashMap::new(),
        }
    }
}

impl Handler for EnumerationValueHandler {
    fn name(&self) -> &'static str {
        "EnumerationValueHandler"
    }

    fn send_message(
        &mut self,
        _channel: &Channel,
        msg: &Message,
        decisions: &mut Decisions,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        let Message::EnumerationValue(m) = msg else {
            return Ok(());
        };
        decisions.nack();

        let attr = self
            .db
            .borrow_mut()
            .get_enumeration_attr(m.enumeration_id)
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
            .label
            .as_deref()
            .map(del_control)
            .ok_or_else(|| HandlerError::bug("enumeration attribute has no label"))?;
        let value_physio_id = attr
            .value_physio_id
            .ok_or_else(|| HandlerError::bug("enumeration attribute has no value physio id"))?;
        let value = m.value.as_deref().map(del_control).unwrap_or_default();

        let key = record.path().to_path_buf();
        let sn = m.sequence_number;
        let ts = m.timestamp;
        let logfile = record.open_log_file("_phi_enums")?;
        let last = self.last_event.get(&key);
        if last.map(|(s, _)| *s) != Some(sn) {
            logfile.append(&format!("S{sn}"))?;
        }
        if last.map(|(_, t)| *t) != Some(ts) {
            logfile.append(&ts.compact_utc())?;
        }
        logfile.append(&format!("{label}\t{value_physio_id}\t{value}"))?;
        self.last_event.insert(key, (sn, ts));

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

/// Known DWC beat codes and their WFDB anntyp / subtyp / aux.
fn ann_code(value_physio_id: &[u8]) -> Option<(AnnotationType, i64, Option<&'static [u8]>)> {
    Some(match value_physio_id {
        b"148631" => (AnnotationType::NORMAL, 0, None), // N - normal
        b"148767" => (AnnotationType::PVC, 0, None),    // V - ventricular
        b"147983" => (AnnotationType::SVPB, 0, None),   // S - supraventricular
        b"148063" => (AnnotationType::PACE, 0, None),   // P - paced (most common)
        b"147543" => (AnnotationType::PACE, 1, None),   // P - paced
        b"147591" => (AnnotationType::PACE, 2, None),   // P - paced (least common)
        b"147631" => (AnnotationType::PACESP, 0, None), // ' - single pacer spike
        b"148751" => (AnnotationType::PACESP, 1, None), // " - bivent. pacer spike
        b"148783" => (AnnotationType::LEARN, 0, None),  // L - learning
        b"147551" => (AnnotationType::NOTE, 0, Some(b"M")), // M - missed beat
        b"195396" => (AnnotationType::UNKNOWN, 0, None), // B - QRS, unspecified
        b"148759" => (AnnotationType::UNKNOWN, 1, None), // ? - unclassifiable
        b"147527" => (AnnotationType::ARFCT, 0, None),  // A - artifact
        b"148743" => (AnnotationType::NOTE, 0, Some(b"_")), // I - inoperable
        _ => return None,
    })
}

/// Unknown codes map by the first letter of the label.
fn ann_letter(first: Option<&u8>) -> AnnotationType {
    match first {
        Some(b'N') => AnnotationType::NORMAL,
        Some(b'V') => AnnotationType::PVC,
        Some(b'S') => AnnotationType::SVPB,
        Some(b'P') => AnnotationType::PACE,
        Some(b'\'') | Some(b'"') => AnnotationType::PACESP,
        Some(b'L') => AnnotationType::LEARN,
        Some(b'M') => AnnotationType::NOTE,
        _ => AnnotationType::UNKNOWN,
    }
}

pub struct EnumerationValueFinalizer {
    log: ArchiveLogReader,
}

impl EnumerationValueFinalizer {
    /// First pass: feed observed timestamps to the time map.
    pub fn new(record: &mut ArchiveRecord) -> std::io::Result<EnumerationValueFinalizer> {
        let log = ArchiveLogReader::open(&record.path().join("_phi_enums"), true)?;
        for item in log.unsorted_items() {
            if let Ok(ts) = DwcTimestamp::parse_compact_utc(&item.timestamp.to_string()) {
                record.time_map.add_time(&ts);
            }
        }
        Ok(EnumerationValueFinalizer { log })
    }

    /// Second pass: emit beat annotations.
    pub fn finalize(&self, record: &mut ArchiveRecord) -> Result<(), crate::finalize::FinalizeError> {
        let Some(sn0) = record.seqnum0() else {
            // Without a base sequence number, time is meaningless.
            return Ok(());
        };
        let sorted = self.log.sorted_items();
        let beats: Vec<&crate::logreader::LogItem> = sorted
            .into_iter()
            .filter(|item| !item.is_corrupt() && item.line.starts_with(b"Annot\t"))
            .collect();
        if beats.is_empty() {
            return Ok(());
        }

        let path = record.path().join("waves.beat");
        let mut anns = Annotator::create(&path, Some(1000.0))?;
        for item in beats {
            let mut fields = item.line.splitn(3, |b| *b == b'\t');
            let (Some(_label), Some(value_physio_id), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let sn = match DwcTimestamp::parse_compact_utc(&item.timestamp.to_string()) {
                Ok(ts) => record
                    .time_map
                    .get_seqnum(&ts, Some(item.seqnum + SEQNUM_LOOKAHEAD_MS))
                    .unwrap_or(item.seqnum),
                Err(_) => item.seqnum,
            };
            let (anntyp, subtyp, aux) = match ann_code(value_physio_id) {
                Some((anntyp, subtyp, aux)) => (anntyp, subtyp, aux.map(<[u8]>::to_vec)),
                None => {
                    let mut aux = Vec::with_capacity(value_physio_id.len() + value.len() + 3);
                    aux.push(b'[');
                    aux.extend_from_slice(value_physio_id);
                    aux.extend_from_slice(b"] ");
                    aux.extend_from_slice(value);
                    (ann_letter(value.first()), 0, Some(aux))
                }
            };
            anns.put(&Annotation {
                time: sn - sn0,
                anntyp,
                subtyp,
                chan: 255,
                num: 0,
                aux,
            })?;
        }
        anns.close()?;
        Ok(())
    }
}
