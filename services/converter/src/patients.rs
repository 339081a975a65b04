//! Patient demographic and attribute messages.
//!
//! Disabled in the default handler set: patient messages arrive on the
//! patient channel with timestamps that lag the bedside data, and letting
//! them touch record end times splits records unnecessarily. The handler
//! is kept for deployments that want the `_phi_patient_info` log anyway.

use std::cell::RefCell;
use std::rc::Rc;

use dwc_core::{Channel, DwcTimestamp, Message};

use crate::archive::{Archive, ArchiveRecord};
use crate::db::DwcDb;
use crate::dispatch::{Decisions, Handler, HandlerError};

pub struct PatientHandler {
    archive: Rc<RefCell<Archive>>,
    db: Rc<RefCell<DwcDb>>,
}

impl PatientHandler {
    pub fn new(archive: Rc<RefCell<Archive>>, db: Rc<RefCell<DwcDb>>) -> PatientHandler {
        PatientHandler { archive, db }
    }

    fn log_info(
        record: &mut ArchiveRecord,
        timestamp: &DwcTimestamp,
        key: &str,
        value: &str,
    ) -> Result<(), HandlerError> {
        let line = format!("{timestamp},{},{}", escape(key), escape(value));
        record.open_log_file("_phi_patient_info")?.append(&line)?;
        Ok(())
    }
}

fn opt_str<T: std::fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "None".to_owned(),
    }
}

/// Escape control characters, commas, quotes, and backslashes as octal.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let code = c as u32;
        if code < 32 || code == 127 || matches!(c, ',' | '"' | '\'' | '\\') {
            out.push_str(&format!("\\{code:03o}"));
        } else {
            out.push(c);
        }
    }
    out
}

impl Handler for PatientHandler {
    fn name(&self) -> &'static str {
        "PatientHandler"
    }

    fn send_message(
        &mut self,
        _channel: &Channel,
        msg: &Message,
        decisions: &mut Decisions,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        let fields: Vec<(String, String)> = match msg {
            Message::PatientBasicInfo(m) => vec![
                ("BedLabel".to_owned(), opt_str(&m.bed_label)),
                ("Alias".to_owned(), opt_str(&m.alias)),
                ("Category".to_owned(), opt_str(&m.category)),
                ("Height".to_owned(), opt_str(&m.height)),
                ("HeightUnit".to_owned(), opt_str(&m.height_unit)),
                ("Weight".to_owned(), opt_str(&m.weight)),
                ("WeightUnit".to_owned(), opt_str(&m.weight_unit)),
                ("PressureUnit".to_owned(), opt_str(&m.pressure_unit)),
                ("PacedMode".to_owned(), opt_str(&m.paced_mode)),
                (
                    "ResuscitationStatus".to_owned(),
                    opt_str(&m.resuscitation_status),
                ),
                ("AdmitState".to_owned(), opt_str(&m.admit_state)),
                ("ClinicalUnit".to_owned(), opt_str(&m.clinical_unit)),
                ("Gender".to_owned(), opt_str(&m.gender)),
            ],
            Message::PatientDateAttribute(m) => {
                vec![(format!("d:{}", m.name), opt_str(&m.value))]
            }
            Message::PatientStringAttribute(m) => {
                vec![(format!("s:{}", m.name), opt_str(&m.value))]
            }
            _ => return Ok(()),
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
        let timestamp = msg.timestamp();
        for (key, value) in fields {
            PatientHandler::log_info(&mut record, &timestamp, &key, &value)?;
        }
        decisions.ack();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HandlerError> {
        self.archive.borrow_mut().flush()
    }
}
