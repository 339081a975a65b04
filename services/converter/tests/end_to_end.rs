//! End-to-end conversion scenarios over real BCP export directories.

use std::cell::RefCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use converter::archive::Archive;
use converter::db::DwcDb;
use converter::extract::Extractor;
use converter::timemap::TimeMap;
use converter::worker::FinalizeMode;
use converter::{add_standard_queues, standard_dispatcher};
use dwc_core::bcp::{format_description, format_message};
use dwc_core::message::{
    Message, MessageKind, NumericValueMessage, Origin, PatientMappingMessage, WaveSampleMessage,
};
use dwc_core::DwcTimestamp;
use uuid::Uuid;

const SERVER: &str = "srv";

fn mapping_id() -> Uuid {
    Uuid::parse_str("3f2c8a10-9d21-4f6e-b0aa-5cb2d1e64b01").expect("uuid")
}

fn patient_id() -> Uuid {
    Uuid::parse_str("9e0d4c2b-7a65-4321-8def-0123456789ab").expect("uuid")
}

fn t(s: &str) -> DwcTimestamp {
    s.parse().expect("timestamp")
}

// ---------------------------------------------------------------------------
// Fixture building
// ---------------------------------------------------------------------------

/// freebcp format description for a metadata table of plain columns.
fn meta_fmt(columns: &[&str]) -> String {
    let mut out = format!("0.0\n{}\n", columns.len());
    let last = columns.len() - 1;
    for (i, name) in columns.iter().enumerate() {
        let term = if i == last { "\"\\n\"" } else { "\"\\t\"" };
        out.push_str(&format!(
            "{} SYBCHAR 0 -1 {} {} {} \"\"\n",
            i + 1,
            term,
            i + 1,
            name.to_lowercase()
        ));
    }
    out
}

const WAVE_META_COLUMNS: &[&str] = &[
    "Id",
    "BasePhysioId",
    "PhysioId",
    "Label",
    "Channel",
    "SamplePeriod",
    "IsSlowWave",
    "IsDerived",
    "Color",
    "LowEdgeFrequency",
    "HighEdgeFrequency",
    "ScaleLower",
    "ScaleUpper",
    "CalibrationScaledLower",
    "CalibrationScaledUpper",
    "CalibrationAbsLower",
    "CalibrationAbsUpper",
    "CalibrationType",
    "UnitLabel",
    "UnitCode",
    "EcgLeadPlacement",
];

const NUMERIC_META_COLUMNS: &[&str] = &[
    "Id",
    "BasePhysioId",
    "PhysioId",
    "Label",
    "IsAperiodic",
    "UnitLabel",
    "Validity",
    "LowerLimit",
    "UpperLimit",
    "IsAlarmingOff",
    "SubPhysioId",
    "SubLabel",
    "Color",
    "IsManual",
    "MaxValues",
    "Scale",
];

/// An ECG wave definition: id 11, 8 ticks per sample, no label (the
/// header description falls back to `ECG #<physio_id>`).
fn write_wave_meta(dir: &Path) {
    std::fs::write(dir.join("Wave.fmt"), meta_fmt(WAVE_META_COLUMNS)).expect("fmt");
    let row = "11\t131328\t131329\t\t0\t8\t0\t0\t\t\t\t0\t0\t\t\t\t\t\t\t\t\n";
    std::fs::write(dir.join("Wave"), row).expect("meta");
}

/// A heart-rate numeric definition: id 7, periodic, bpm.
fn write_numeric_meta(dir: &Path) {
    std::fs::write(dir.join("Numeric.fmt"), meta_fmt(NUMERIC_META_COLUMNS)).expect("fmt");
    let row = "7\t147842\t147842\tHR\t0\tbpm\t\t\t\t\t147842\tHR\t\t0\t\t0\n";
    std::fs::write(dir.join("Numeric"), row).expect("meta");
}

fn write_messages(dir: &Path, kind: MessageKind, messages: &[Message]) {
    let mut sorted: Vec<&Message> = messages.iter().collect();
    sorted.sort_by_key(|m| m.timestamp());
    let name = format!("{}.20170301_20170302", kind.abbr());
    let mut f = std::fs::File::create(dir.join(name)).expect("data file");
    for m in sorted {
        f.write_all(&format_message(m)).expect("row");
    }
    std::fs::write(dir.join(format!("{}.fmt", kind.abbr())), format_description(kind))
        .expect("fmt");
}

fn mapping_message(ts: &str) -> Message {
    Message::PatientMapping(PatientMappingMessage {
        origin: Origin::new(SERVER),
        mapping_id: mapping_id(),
        patient_id: patient_id(),
        timestamp: t(ts),
        is_mapped: Some(true),
        hostname: Some("export-host".to_owned()),
    })
}

fn wave_message(ts: &str, seq: i64, samples: &[u8]) -> Message {
    Message::WaveSample(WaveSampleMessage {
        origin: Origin::new(SERVER),
        wave_id: 11,
        timestamp: t(ts),
        sequence_number: seq,
        wave_samples: samples.to_vec(),
        unavailable_samples: None,
        invalid_samples: None,
        paced_pulses: None,
        mapping_id: mapping_id(),
    })
}

fn numeric_message(ts: &str, seq: i64, value: &str) -> Message {
    Message::NumericValue(NumericValueMessage {
        origin: Origin::new(SERVER),
        numeric_id: 7,
        timestamp: t(ts),
        sequence_number: seq,
        is_trend_uploaded: None,
        compound_value_id: None,
        value: Some(value.parse().expect("decimal")),
        mapping_id: mapping_id(),
    })
}

// ---------------------------------------------------------------------------
// Driving the pipeline
// ---------------------------------------------------------------------------

fn run_conversion(
    data_dir: &Path,
    output_dir: &Path,
    state_dir: &Path,
    end: &str,
    terminate: bool,
    finalize_mode: FinalizeMode,
) {
    std::fs::create_dir_all(output_dir).expect("output dir");
    std::fs::create_dir_all(state_dir).expect("state dir");

    let db = Rc::new(RefCell::new(
        DwcDb::open(SERVER, vec![data_dir.to_path_buf()]).expect("open db"),
    ));
    let archive = Rc::new(RefCell::new(
        Archive::open(output_dir, finalize_mode).expect("open archive"),
    ));
    let dispatcher = standard_dispatcher(&archive, &db, false, false);
    let mut extractor =
        Extractor::new(Rc::clone(&db), Some(state_dir), Box::new(dispatcher)).expect("extractor");
    add_standard_queues(&mut extractor, None, Some(t(end)), 100, 600_000).expect("queues");

    let mut fuel = 100_000;
    while !extractor.idle() {
        extractor.run().expect("run");
        fuel -= 1;
        assert!(fuel > 0, "extractor failed to reach idle");
    }
    if terminate {
        extractor.dispatcher.terminate().expect("terminate");
    }
    extractor.flush().expect("flush");
    if terminate {
        let mut archive = archive.borrow_mut();
        archive.terminate().expect("archive terminate");
        archive.flush().expect("archive flush");
    }
}

fn record_dir(output_dir: &Path, datestamp: &str) -> PathBuf {
    let rid = patient_id().to_string();
    output_dir
        .join(&rid[0..2])
        .join(format!("{SERVER}_{rid}_{datestamp}"))
}

fn read_properties(record: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(record.join("_phi_properties")).expect("properties");
    serde_json::from_str(&text).expect("json")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn single_wave_message_produces_one_segment_record() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).expect("data dir");
    write_wave_meta(&data);
    write_messages(
        &data,
        MessageKind::PatientMapping,
        &[mapping_message("2017-03-01 10:00:00.000 +00:00")],
    );
    write_messages(
        &data,
        MessageKind::WaveSample,
        &[wave_message(
            "2017-03-01 12:00:00.000 +00:00",
            500_000_000_000,
            &[0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00],
        )],
    );

    let output = tmp.path().join("output");
    let state = tmp.path().join("state");
    run_conversion(
        &data,
        &output,
        &state,
        "2017-03-02 00:00:00.000 +00:00",
        true,
        FinalizeMode::InProcess,
    );

    let record = record_dir(&output, "20170301-1200");
    assert!(record.is_dir(), "missing {record:?}");

    // One segment of 2 frames x 2 samples x 2 bytes.
    let dat = std::fs::read(record.join("000000000.dat")).expect("dat");
    assert_eq!(dat, vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00]);

    let hea = std::fs::read_to_string(record.join("000000000.hea")).expect("hea");
    assert!(hea.contains("ECG #131329"), "{hea}");
    assert!(hea.contains("/mV"), "{hea}");
    assert!(hea.contains("62.5/1000"), "{hea}");

    let props = read_properties(&record);
    assert_eq!(props["base_sequence_number"], 500_000_000_000i64);
    assert_eq!(props["finalized"], 1);

    let mut map = TimeMap::new("test");
    map.read(&record, "_phi_time_map").expect("time map");
    assert_eq!(map.spans().len(), 1);
    assert_eq!(map.spans()[0].start, 500_000_000_000);
    assert_eq!(map.spans()[0].end, 500_000_000_000);
    assert_eq!(
        map.get_time(500_000_000_000),
        Some(t("2017-03-01 12:00:00.000 +00:00"))
    );

    // The joined record header exists; no annotations or numerics were
    // produced for a lone clean wave message.
    assert!(record.join("waves.hea").is_file());
    assert!(record.join("waves_layout.hea").is_file());
    assert!(!record.join("waves.beat").exists());
    assert!(!record.join("waves.alarm").exists());
    assert!(!record.join("waves.wq").exists());
    assert!(!record.join("numerics.csv").exists());
}

#[test]
fn idle_gap_splits_into_two_records_and_finalizes_the_first() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).expect("data dir");
    write_wave_meta(&data);
    write_messages(
        &data,
        MessageKind::PatientMapping,
        &[mapping_message("2017-03-01 10:00:00.000 +00:00")],
    );
    // 60 minutes + 1 ms apart: past the split interval.
    write_messages(
        &data,
        MessageKind::WaveSample,
        &[
            wave_message(
                "2017-03-01 12:00:00.000 +00:00",
                500_000_000_000,
                &[0x01, 0x00, 0x02, 0x00],
            ),
            wave_message(
                "2017-03-01 13:00:00.001 +00:00",
                500_003_600_001,
                &[0x05, 0x00, 0x06, 0x00],
            ),
        ],
    );

    let output = tmp.path().join("output");
    let state = tmp.path().join("state");
    // Worker mode: the first record is finalized by a spawned child
    // process.
    run_conversion(
        &data,
        &output,
        &state,
        "2017-03-02 00:00:00.000 +00:00",
        true,
        FinalizeMode::Worker {
            exe: PathBuf::from(env!("CARGO_BIN_EXE_converter")),
        },
    );

    let first = record_dir(&output, "20170301-1200");
    let second = record_dir(&output, "20170301-1300");
    assert!(first.is_dir(), "missing {first:?}");
    assert!(second.is_dir(), "missing {second:?}");
    assert_eq!(read_properties(&first)["finalized"], 1);
    assert_eq!(read_properties(&second)["finalized"], 1);
}

#[test]
fn rerunning_over_the_same_input_adds_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).expect("data dir");
    write_numeric_meta(&data);
    write_messages(
        &data,
        MessageKind::PatientMapping,
        &[mapping_message("2017-03-01 10:00:00.000 +00:00")],
    );
    write_messages(
        &data,
        MessageKind::NumericValue,
        &[
            numeric_message("2017-03-01 12:00:00.000 +00:00", 500_000_000_000, "72"),
            numeric_message("2017-03-01 12:00:01.024 +00:00", 500_000_001_024, "73.5"),
        ],
    );

    let output = tmp.path().join("output");
    let state = tmp.path().join("state");
    let end = "2017-03-01 18:00:00.000 +00:00";
    run_conversion(&data, &output, &state, end, false, FinalizeMode::InProcess);

    let record = record_dir(&output, "20170301-1200");
    let log_after_first = std::fs::read(record.join("_phi_numerics")).expect("numerics log");
    assert!(!log_after_first.is_empty());

    // Same state directory, fresh extractor: previously-acked messages
    // must be recognized and not re-logged.
    run_conversion(&data, &output, &state, end, false, FinalizeMode::InProcess);
    let log_after_second = std::fs::read(record.join("_phi_numerics")).expect("numerics log");
    assert_eq!(log_after_first, log_after_second);
}

#[test]
fn records_below_the_horizon_dump_raw_bcp() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).expect("data dir");
    write_numeric_meta(&data);
    write_messages(
        &data,
        MessageKind::PatientMapping,
        &[mapping_message("2017-03-01 10:00:00.000 +00:00")],
    );
    let numeric = numeric_message("2017-03-01 12:00:00.000 +00:00", 500_000_000_000, "72");
    write_messages(&data, MessageKind::NumericValue, &[numeric.clone()]);

    let output = tmp.path().join("output");
    std::fs::create_dir_all(&output).expect("output dir");
    // Horizon after the data: the record starts inside the unusable
    // boundary window and must be kept raw.
    std::fs::write(output.join("%horizon"), "2017-03-01 11:30:00.000 +00:00\n")
        .expect("horizon");

    let state = tmp.path().join("state");
    run_conversion(
        &data,
        &output,
        &state,
        "2017-03-01 18:00:00.000 +00:00",
        true,
        FinalizeMode::InProcess,
    );

    let record = record_dir(&output, "20170301-1200");
    assert!(record.is_dir(), "missing {record:?}");
    let dumped = std::fs::read(record.join("_dump_NumericValue.dat")).expect("dump file");
    assert_eq!(dumped, format_message(&numeric));
    assert!(record.join("_dump_NumericValue.fmt").is_file());
    assert!(!record.join("_phi_numerics").exists());
    assert_eq!(read_properties(&record)["dump"], 1);
    assert_eq!(read_properties(&record)["finalized"], 1);
}

#[test]
fn numerics_finalize_into_a_wide_csv() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).expect("data dir");
    write_wave_meta(&data);
    write_numeric_meta(&data);
    write_messages(
        &data,
        MessageKind::PatientMapping,
        &[mapping_message("2017-03-01 10:00:00.000 +00:00")],
    );
    // A wave message anchors the time map so the numerics can be
    // translated to counter time.
    write_messages(
        &data,
        MessageKind::WaveSample,
        &[wave_message(
            "2017-03-01 12:00:00.000 +00:00",
            500_000_000_000,
            &[0x01, 0x00, 0x02, 0x00],
        )],
    );
    write_messages(
        &data,
        MessageKind::NumericValue,
        &[
            numeric_message("2017-03-01 12:00:01.024 +00:00", 500_000_000_000, "72"),
            numeric_message("2017-03-01 12:00:02.048 +00:00", 500_000_001_024, "73.50"),
        ],
    );

    let output = tmp.path().join("output");
    let state = tmp.path().join("state");
    run_conversion(
        &data,
        &output,
        &state,
        "2017-03-01 18:00:00.000 +00:00",
        true,
        FinalizeMode::InProcess,
    );

    let record = record_dir(&output, "20170301-1200");
    let csv = std::fs::read_to_string(record.join("numerics.csv")).expect("csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "\"time\",\"HR [bpm]\"");
    // Counter times relative to the wave message's sequence number;
    // trailing fractional zeros are trimmed.
    assert_eq!(lines[1], "1024,72");
    assert_eq!(lines[2], "2048,73.5");
}
