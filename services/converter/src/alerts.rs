//! Alarms: the live handler and the finalizer.
//!
//! Every alarm state report is appended to `_phi_alerts` with its own
//! timestamp plus any announce/onset/end times the monitor attached
//! (times before 1970 are the vendor's way of saying "unknown"). The
//! finalizer reduces the stream to one onset, one announce, and one end
//! annotation per alarm, plus a change annotation whenever the
//! severity/silenced/label state moves while the alarm is active.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::OnceLock;

use dwc_core::text::string_to_ascii;
use dwc_core::{Channel, DwcTimestamp, Message};
use regex::bytes::Regex;
use wfdb_io::{Annotation, AnnotationType, Annotator};

use crate::archive::{Archive, ArchiveRecord};
use crate::db::DwcDb;
use crate::dispatch::{Decisions, Handler, HandlerError};
use crate::logreader::ArchiveLogReader;

fn sane_time() -> DwcTimestamp {
    "1970-01-01 00:00:00.000 +00:00"
        .parse()
        .unwrap_or_else(|_| DwcTimestamp::very_old())
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct AlertHandler {
    archive: Rc<RefCell<Archive>>,
    db: Rc<RefCell<DwcDb>>,
}

impl AlertHandler {
    pub fn new(archive: Rc<RefCell<Archive>>, db: Rc<RefCell<DwcDb>>) -> AlertHandler {
        AlertHandler { archive, db }
    }
}

impl Handler for AlertHandler {
    fn name(&self) -> &'static str {
        "AlertHandler"
    }

    fn send_message(
        &mut self,
        _channel: &Channel,
        msg: &Message,
        decisions: &mut Decisions,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        let Message::Alert(m) = msg else {
            return Ok(());
        };
        decisions.nack();

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

        let idstr = m
            .alert_id
            .map_or_else(|| "None".to_owned(), |u| u.to_string());
        let label = string_to_ascii(&m.label);
        let severity = m
            .severity
            .map_or_else(|| "None".to_owned(), |s| s.to_string());
        let statestr = if m.is_silenced.unwrap_or(false) {
            '~'
        } else {
            '='
        };
        let sane = sane_time();

        let logfile = record.open_log_file("_phi_alerts")?;
        logfile.append(&format!("S{}", m.sequence_number))?;
        if let Some(ats) = m.announce_time.filter(|t| *t > sane) {
            logfile.append(&ats.compact_utc())?;
            logfile.append(&format!("({idstr})+"))?;
        }
        if let Some(ots) = m.onset_time.filter(|t| *t > sane) {
            logfile.append(&ots.compact_utc())?;
            logfile.append(&format!("({idstr})!"))?;
        }
        if let Some(ets) = m.end_time.filter(|t| *t > sane) {
            logfile.append(&ets.compact_utc())?;
            logfile.append(&format!("({idstr})-"))?;
        }
        logfile.append(&m.timestamp.compact_utc())?;
        logfile.append(&format!("({idstr}){severity}{statestr}{label}"))?;

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

fn info_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(([\w-]+)\)(?:([-+!])|(\d+)([=~])(.*))$").expect("static regex")
    })
}

struct AlertLine<'a> {
    alert_id: &'a [u8],
    event: Option<u8>,
    severity: Option<&'a [u8]>,
    state: Option<u8>,
    label: Option<&'a [u8]>,
}

fn parse_info(line: &[u8]) -> Option<AlertLine<'_>> {
    let caps = info_re().captures(line)?;
    let get = |i: usize| caps.get(i).map(|m| m.as_bytes());
    Some(AlertLine {
        alert_id: get(1)?,
        event: get(2).and_then(<[u8]>::first).copied(),
        severity: get(3),
        state: get(4).and_then(<[u8]>::first).copied(),
        label: get(5),
    })
}

type AlertState = (i64, u8, Vec<u8>);

pub struct AlertFinalizer {
    log: ArchiveLogReader,
    onset: BTreeMap<Vec<u8>, DwcTimestamp>,
    announce: BTreeMap<Vec<u8>, DwcTimestamp>,
    end: BTreeMap<Vec<u8>, DwcTimestamp>,
}

impl AlertFinalizer {
    /// First pass: feed timestamps to the time map and find each alarm's
    /// earliest onset/announce and latest end.
    pub fn new(record: &mut ArchiveRecord) -> std::io::Result<AlertFinalizer> {
        let log = ArchiveLogReader::open(&record.path().join("_phi_alerts"), true)?;
        let mut onset: BTreeMap<Vec<u8>, DwcTimestamp> = BTreeMap::new();
        let mut announce: BTreeMap<Vec<u8>, DwcTimestamp> = BTreeMap::new();
        let mut end: BTreeMap<Vec<u8>, DwcTimestamp> = BTreeMap::new();

        for item in log.unsorted_items() {
            let Ok(ts) = DwcTimestamp::parse_compact_utc(&item.timestamp.to_string()) else {
                continue;
            };
            record.time_map.add_time(&ts);
            if item.is_corrupt() {
                continue;
            }
            let Some(info) = parse_info(&item.line) else {
                continue;
            };
            match info.event {
                Some(b'!') => {
                    let entry = onset.entry(info.alert_id.to_vec()).or_insert(ts);
                    if ts < *entry {
                        *entry = ts;
                    }
                }
                Some(b'+') => {
                    let entry = announce.entry(info.alert_id.to_vec()).or_insert(ts);
                    if ts < *entry {
                        *entry = ts;
                    }
                }
                Some(b'-') => {
                    let entry = end.entry(info.alert_id.to_vec()).or_insert(ts);
                    if ts > *entry {
                        *entry = ts;
                    }
                }
                _ => {}
            }
        }
        Ok(AlertFinalizer {
            log,
            onset,
            announce,
            end,
        })
    }

    /// Second pass: write `waves.alarm`.
    pub fn finalize(&self, record: &mut ArchiveRecord) -> Result<(), crate::finalize::FinalizeError> {
        let Some(sn0) = record.seqnum0() else {
            return Ok(());
        };

        let mut alert_first: BTreeMap<Vec<u8>, AlertState> = BTreeMap::new();
        let mut alert_last: BTreeMap<Vec<u8>, AlertState> = BTreeMap::new();
        let mut alert_num: BTreeMap<Vec<u8>, i64> = BTreeMap::new();
        // (time, emit order, annotation parameters)
        let mut pending: Vec<(i64, usize, i64, u8, i64, Vec<u8>)> = Vec::new();

        for item in self.log.sorted_items() {
            if item.is_corrupt() {
                continue;
            }
            let Some(info) = parse_info(&item.line) else {
                continue;
            };
            let (Some(severity), Some(state), Some(label)) =
                (info.severity, info.state, info.label)
            else {
                continue;
            };
            let Ok(severity) = std::str::from_utf8(severity)
                .unwrap_or("")
                .parse::<i64>()
            else {
                continue;
            };
            let Ok(ts) = DwcTimestamp::parse_compact_utc(&item.timestamp.to_string()) else {
                continue;
            };
            let sn = record
                .time_map
                .get_seqnum(&ts, None)
                .unwrap_or(item.seqnum);
            let t = sn - sn0;

            let id = info.alert_id.to_vec();
            let next_num = alert_num.len() as i64 + 1;
            let num = *alert_num.entry(id.clone()).or_insert(next_num);
            let newstate: AlertState = (severity, state, label.to_vec());
            let oldstate = alert_last.get(&id).cloned();
            alert_first.entry(id.clone()).or_insert_with(|| newstate.clone());
            alert_last.insert(id.clone(), newstate.clone());

            let announce = self.announce.get(&id);
            let end = self.end.get(&id);
            let changed = oldstate.is_some_and(|old| old != newstate);
            let active = announce.is_none_or(|a| ts > *a) && end.is_none_or(|e| ts < *e);
            if changed && active {
                let order = pending.len();
                pending.push((t, order, num, b';', severity, build_aux(b';', num, state, label)));
            }
        }

        for (map, event) in [
            (&self.onset, b'+'),
            (&self.announce, b'<'),
            (&self.end, b'>'),
        ] {
            for (id, ts) in map {
                let Some(&num) = alert_num.get(id) else {
                    continue;
                };
                let Some(sn) = record.time_map.get_seqnum(ts, None) else {
                    continue;
                };
                let t = sn - sn0;
                let states = if event == b'>' {
                    &alert_last
                } else {
                    &alert_first
                };
                let Some((severity, state, label)) = states.get(id) else {
                    continue;
                };
                let order = pending.len();
                pending.push((
                    t,
                    order,
                    num,
                    event,
                    *severity,
                    build_aux(event, num, *state, label),
                ));
            }
        }

        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let path = record.path().join("waves.alarm");
        let mut anns = Annotator::create(&path, Some(1000.0))?;
        for (t, _, num, event, severity, aux) in pending {
            anns.put(&Annotation {
                time: t,
                anntyp: AnnotationType::NOTE,
                subtyp: subtyp_for(event, severity),
                chan: 255,
                num,
                aux: Some(aux),
            })?;
        }
        anns.close()?;
        Ok(())
    }
}

/// Subtype encodes severity (RED 3, YELLOW 2, SHORT YELLOW 1, else 0)
/// plus the event kind base.
fn subtyp_for(event: u8, severity: i64) -> i64 {
    let sev = match severity {
        0 => 3,
        1 => 2,
        2 => 1,
        _ => 0,
    };
    let base = match event {
        b'+' => 90,
        b'<' => 80,
        b'>' => 60,
        _ => 70,
    };
    sev + base
}

fn build_aux(event: u8, num: i64, state: u8, label: &[u8]) -> Vec<u8> {
    let mut aux = Vec::with_capacity(label.len() + 8);
    aux.push(event);
    aux.push(b'{');
    aux.extend_from_slice(num.to_string().as_bytes());
    aux.push(b'}');
    aux.push(if state == b'~' { b'~' } else { b' ' });
    aux.extend_from_slice(label);
    aux
}
