//! Read-only database over freebcp-format flat files.
//!
//! This is the driver layer the ingest engine pulls rows through. It
//! supports exactly the query shape the converter needs: single-table
//! range scans over the table's physical order, with residual predicate
//! checks, an optional unique-id index, reverse scans, and limits.

pub mod connection;
pub mod error;
pub mod query;
pub mod schema;
pub mod table;
pub mod value;

pub use connection::Connection;
pub use error::{BcpError, Result};
pub use query::{Query, Relation, RowCheck};
pub use table::{Row, TableDefs};
pub use value::{ColumnType, Value};

#[cfg(test)]
mod tests {
    use super::schema;
    use super::{Query, Relation, Value};
    use dwc_core::bcp::{format_description, format_message};
    use dwc_core::message::{Message, MessageKind, Origin, PatientMappingMessage, WaveSampleMessage};
    use dwc_core::DwcTimestamp;
    use std::io::Write;
    use uuid::Uuid;

    fn mapping_uuid() -> Uuid {
        Uuid::parse_str("8a2b6f4e-1234-5678-9abc-def012345678").expect("uuid")
    }

    fn wave_message(ts: &str, seq: i64, samples: &[u8]) -> Message {
        Message::WaveSample(WaveSampleMessage {
            origin: Origin::new("test"),
            wave_id: 11,
            timestamp: ts.parse().expect("timestamp"),
            sequence_number: seq,
            wave_samples: samples.to_vec(),
            unavailable_samples: None,
            invalid_samples: Some("0 1".to_owned()),
            paced_pulses: None,
            mapping_id: mapping_uuid(),
        })
    }

    fn write_table(dir: &std::path::Path, kind: MessageKind, name: &str, messages: &[Message]) {
        let mut data = std::fs::File::create(dir.join(name)).expect("data file");
        for m in messages {
            data.write_all(&format_message(m)).expect("write row");
        }
        std::fs::write(
            dir.join(format!("{}.fmt", kind.abbr())),
            format_description(kind),
        )
        .expect("fmt file");
    }

    #[test]
    fn range_query_round_trips_wave_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let messages = vec![
            wave_message("2017-03-01 12:00:00.000 +00:00", 500_000_000_000, &[1, 0, 2, 0]),
            wave_message("2017-03-01 12:00:01.024 +00:00", 500_000_001_024, &[3, 0, 4, 0]),
            wave_message("2017-03-01 12:00:02.048 +00:00", 500_000_002_048, &[5, 0, 6, 0]),
        ];
        write_table(
            dir.path(),
            MessageKind::WaveSample,
            "WaveSample.20170301_20170302",
            &messages,
        );

        let mut conn = schema::connect(&[dir.path()]).expect("connect");
        let start: DwcTimestamp = "2017-03-01 12:00:01.000 +00:00".parse().unwrap();
        let query = Query::select(
            "_Export.WaveSample_",
            vec![
                "WaveId".into(),
                "TimeStamp".into(),
                "SequenceNumber".into(),
                "WaveSamples".into(),
                "InvalidSamples".into(),
                "MappingId".into(),
            ],
        )
        .constraint("TimeStamp", Relation::Ge, Value::Time(start))
        .order_by("TimeStamp", false)
        .limit(10);

        let rows = conn.execute(&query).expect("execute");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Int(11));
        assert_eq!(rows[0][2], Value::Int(500_000_001_024));
        assert_eq!(rows[0][3], Value::Bytes(vec![3, 0, 4, 0]));
        assert_eq!(rows[0][4], Value::Str("0 1".to_owned()));
        assert_eq!(rows[0][5], Value::Uuid(mapping_uuid()));
    }

    #[test]
    fn persistent_iterator_resumes_forward_scans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let messages: Vec<Message> = (0..20)
            .map(|i| {
                wave_message(
                    &format!("2017-03-01 12:00:{:02}.000 +00:00", i),
                    500_000_000_000 + i64::from(i) * 1000,
                    &[1, 0],
                )
            })
            .collect();
        write_table(
            dir.path(),
            MessageKind::WaveSample,
            "WaveSample.20170301_20170302",
            &messages,
        );
        let mut conn = schema::connect(&[dir.path()]).expect("connect");

        let fetch_from = |conn: &mut super::Connection, ts: &str, limit: usize| {
            let start: DwcTimestamp = ts.parse().unwrap();
            let q = Query::select("_Export.WaveSample_", vec!["SequenceNumber".into()])
                .constraint("TimeStamp", Relation::Ge, Value::Time(start))
                .order_by("TimeStamp", false)
                .limit(limit);
            conn.execute(&q).expect("execute")
        };

        let first = fetch_from(&mut conn, "2017-03-01 12:00:00.000 +00:00", 5);
        assert_eq!(first.len(), 5);
        let second = fetch_from(&mut conn, "2017-03-01 12:00:05.000 +00:00", 5);
        assert_eq!(second[0][0], Value::Int(500_000_005_000));
        // Rewind also works.
        let third = fetch_from(&mut conn, "2017-03-01 12:00:01.000 +00:00", 1);
        assert_eq!(third[0][0], Value::Int(500_000_001_000));
    }

    #[test]
    fn reverse_limit_one_returns_newest_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let messages: Vec<Message> = (0..5)
            .map(|i| {
                wave_message(
                    &format!("2017-03-01 12:00:{:02}.000 +00:00", i),
                    500_000_000_000 + i64::from(i) * 1000,
                    &[1, 0],
                )
            })
            .collect();
        write_table(
            dir.path(),
            MessageKind::WaveSample,
            "WaveSample.20170301_20170302",
            &messages,
        );
        let mut conn = schema::connect(&[dir.path()]).expect("connect");
        let q = Query::select("_Export.WaveSample_", vec!["SequenceNumber".into()])
            .order_by("TimeStamp", true)
            .limit(1);
        let rows = conn.execute(&q).expect("execute");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Int(500_000_004_000));
    }

    #[test]
    fn unique_id_index_finds_patient_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let patient = Uuid::parse_str("d9c1a1e2-0000-4000-8000-000000000001").unwrap();
        let messages: Vec<Message> = (0..3)
            .map(|i| {
                Message::PatientMapping(PatientMappingMessage {
                    origin: Origin::new("test"),
                    mapping_id: Uuid::from_u128(0x1000 + i),
                    patient_id: patient,
                    timestamp: format!("2017-03-01 10:00:0{i}.000 +00:00").parse().unwrap(),
                    is_mapped: Some(true),
                    hostname: Some("host".to_owned()),
                })
            })
            .collect();
        write_table(
            dir.path(),
            MessageKind::PatientMapping,
            "PatientMapping.20170301_20170302",
            &messages,
        );
        let mut conn = schema::connect(&[dir.path()]).expect("connect");
        let q = Query::select(
            "_Export.PatientMapping_",
            vec!["Id".into(), "PatientId".into()],
        )
        .constraint("Id", Relation::Eq, Value::Uuid(Uuid::from_u128(0x1001)))
        .limit(2);
        let rows = conn.execute(&q).expect("execute");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Uuid(Uuid::from_u128(0x1001)));
        assert_eq!(rows[0][1], Value::Uuid(patient));
    }

    #[test]
    fn null_and_empty_string_fields_are_distinguished() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut msg = wave_message("2017-03-01 12:00:00.000 +00:00", 1, &[1, 0]);
        if let Message::WaveSample(m) = &mut msg {
            m.invalid_samples = Some(String::new());
            m.paced_pulses = None;
        }
        write_table(
            dir.path(),
            MessageKind::WaveSample,
            "WaveSample.20170301_20170302",
            &[msg],
        );
        let mut conn = schema::connect(&[dir.path()]).expect("connect");
        let q = Query::select(
            "_Export.WaveSample_",
            vec!["InvalidSamples".into(), "PacedPulses".into()],
        )
        .order_by("TimeStamp", false);
        let rows = conn.execute(&q).expect("execute");
        assert_eq!(rows[0][0], Value::Str(String::new()));
        assert_eq!(rows[0][1], Value::Null);
    }
}
