// converter: Library entry point.
// Exposes modules for integration testing.

pub mod alerts;
pub mod archive;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod enums;
pub mod extract;
pub mod finalize;
pub mod logfile;
pub mod logreader;
pub mod mapping;
pub mod numerics;
pub mod parallel;
pub mod parser;
pub mod patients;
pub mod timemap;
pub mod waves;
pub mod worker;

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use archive::Archive;
use db::DwcDb;
use dispatch::{Dispatcher, LogDeadLetterHandler};
use extract::{Extractor, ExtractorQueue, QueueKind};
use worker::FinalizeMode;

/// Wire up the standard queue set on an extractor: mapping first, then
/// the patient streams, then the data streams (all of which stall behind
/// the mapping queue). Returns nothing; queue order only affects
/// round-robin idling.
pub fn add_standard_queues(
    extractor: &mut Extractor,
    start: Option<dwc_core::DwcTimestamp>,
    end: Option<dwc_core::DwcTimestamp>,
    messages_per_batch: usize,
    patient_mapping_delay_ms: i64,
) -> std::io::Result<()> {
    let pm = extractor.add_queue(ExtractorQueue::new(
        "mapping",
        QueueKind::PatientMapping,
        start,
        end,
        messages_per_batch,
    ))?;
    extractor.add_queue(ExtractorQueue::new(
        "patients",
        QueueKind::PatientBasicInfo,
        start,
        end,
        messages_per_batch,
    ))?;
    extractor.add_queue(ExtractorQueue::new(
        "strings",
        QueueKind::PatientStringAttribute,
        start,
        end,
        messages_per_batch,
    ))?;
    extractor.add_queue(ExtractorQueue::new(
        "dates",
        QueueKind::PatientDateAttribute,
        start,
        end,
        messages_per_batch,
    ))?;

    for (name, kind) in [
        ("waves", QueueKind::WaveSample),
        ("numerics", QueueKind::NumericValue),
        ("enums", QueueKind::EnumerationValue),
        ("alerts", QueueKind::Alert),
    ] {
        let mut queue = ExtractorQueue::new(name, kind, start, end, messages_per_batch);
        queue.patient_mapping = Some((pm, patient_mapping_delay_ms));
        extractor.add_queue(queue)?;
    }
    Ok(())
}

/// Build the standard in-process handler set around one archive.
///
/// Patient-info handling is deliberately not registered: patient
/// messages lag the bedside streams and splitting records on their
/// timestamps breaks stays apart. Pass `with_patients` to opt in.
pub fn standard_dispatcher(
    archive: &Rc<RefCell<Archive>>,
    db: &Rc<RefCell<DwcDb>>,
    fatal_bugs: bool,
    with_patients: bool,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(fatal_bugs);
    dispatcher.add_handler(Box::new(numerics::NumericValueHandler::new(
        Rc::clone(archive),
        Rc::clone(db),
    )));
    dispatcher.add_handler(Box::new(waves::WaveSampleHandler::new(
        Rc::clone(archive),
        Rc::clone(db),
    )));
    dispatcher.add_handler(Box::new(enums::EnumerationValueHandler::new(
        Rc::clone(archive),
        Rc::clone(db),
    )));
    dispatcher.add_handler(Box::new(alerts::AlertHandler::new(
        Rc::clone(archive),
        Rc::clone(db),
    )));
    dispatcher.add_handler(Box::new(mapping::PatientMappingHandler::new(Rc::clone(
        db,
    ))));
    if with_patients {
        dispatcher.add_handler(Box::new(patients::PatientHandler::new(
            Rc::clone(archive),
            Rc::clone(db),
        )));
    }
    dispatcher.add_dead_letter_handler(Box::new(LogDeadLetterHandler));
    dispatcher
}

/// Open the archive and the standard dispatcher around it.
pub fn open_archive_and_dispatcher(
    output_dir: &Path,
    db: &Rc<RefCell<DwcDb>>,
    finalize_mode: FinalizeMode,
    fatal_bugs: bool,
) -> std::io::Result<(Rc<RefCell<Archive>>, Dispatcher)> {
    let archive = Rc::new(RefCell::new(Archive::open(output_dir, finalize_mode)?));
    let dispatcher = standard_dispatcher(&archive, db, fatal_bugs, false);
    Ok((archive, dispatcher))
}
