//! BCP flat-file encoding of messages.
//!
//! The bulk-copy format is what `freebcp` emits: `\t` between fields, `\n`
//! after the last, nulls as empty fields, empty strings as a single NUL
//! byte, booleans as `0`/`1`, UUIDs uppercase, and `WaveSamples` as a raw
//! blob prefixed with a little-endian u32 length (and no field terminator
//! of its own). A `.fmt` companion file describes the column layout.
//!
//! Dump-mode records write these lines verbatim; the `dwc-bcp` crate reads
//! them back.

use uuid::Uuid;

use crate::message::{Message, MessageKind};
use crate::time::DwcTimestamp;

// ---------------------------------------------------------------------------
// Field rendering
// ---------------------------------------------------------------------------

enum Field {
    /// Tab- (or newline-) terminated text field.
    Text(Vec<u8>),
    /// Length-prefixed blob with no terminator.
    Blob(Vec<u8>),
}

fn null() -> Field {
    Field::Text(Vec::new())
}

fn text(s: &str) -> Field {
    if s.is_empty() {
        // Empty string is distinguished from null by a single NUL byte.
        Field::Text(vec![0])
    } else {
        Field::Text(s.as_bytes().to_vec())
    }
}

fn opt_text(s: Option<&str>) -> Field {
    s.map_or_else(null, text)
}

fn int(v: i64) -> Field {
    text(&v.to_string())
}

fn opt_int(v: Option<i64>) -> Field {
    v.map_or_else(null, int)
}

fn boolean(v: bool) -> Field {
    text(if v { "1" } else { "0" })
}

fn opt_bool(v: Option<bool>) -> Field {
    v.map_or_else(null, boolean)
}

fn uuid(v: Uuid) -> Field {
    text(&v.to_string().to_uppercase())
}

fn opt_uuid(v: Option<Uuid>) -> Field {
    v.map_or_else(null, uuid)
}

fn time(v: &DwcTimestamp) -> Field {
    text(&v.to_string())
}

fn opt_time(v: Option<&DwcTimestamp>) -> Field {
    v.map_or_else(null, time)
}

fn opt_display<T: std::fmt::Display>(v: Option<&T>) -> Field {
    match v {
        Some(v) => text(&v.to_string()),
        None => null(),
    }
}

fn blob(v: &[u8]) -> Field {
    Field::Blob(v.to_vec())
}

// ---------------------------------------------------------------------------
// Message encoding
// ---------------------------------------------------------------------------

/// Encode a message as one BCP row.
///
/// The internal `origin` field is not part of the row.
pub fn format_message(message: &Message) -> Vec<u8> {
    let fields = message_fields(message);
    let mut out = Vec::new();
    let last = fields.len() - 1;
    for (i, field) in fields.into_iter().enumerate() {
        match field {
            Field::Text(bytes) => {
                out.extend_from_slice(&bytes);
                out.push(if i == last { b'\n' } else { b'\t' });
            }
            Field::Blob(bytes) => {
                out.extend_from_slice(&u32::try_from(bytes.len()).unwrap_or(0).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
        }
    }
    out
}

fn message_fields(message: &Message) -> Vec<Field> {
    match message {
        Message::WaveSample(m) => vec![
            int(m.wave_id),
            time(&m.timestamp),
            int(m.sequence_number),
            blob(&m.wave_samples),
            opt_text(m.unavailable_samples.as_deref()),
            opt_text(m.invalid_samples.as_deref()),
            opt_text(m.paced_pulses.as_deref()),
            uuid(m.mapping_id),
        ],
        Message::Alert(m) => vec![
            time(&m.timestamp),
            int(m.sequence_number),
            opt_uuid(m.alert_id),
            opt_int(m.source),
            opt_int(m.code),
            text(&m.label),
            opt_int(m.severity),
            opt_int(m.kind),
            opt_bool(m.is_silenced),
            opt_int(m.subtype_id),
            opt_time(m.announce_time.as_ref()),
            opt_time(m.onset_time.as_ref()),
            opt_time(m.end_time.as_ref()),
            uuid(m.mapping_id),
        ],
        Message::EnumerationValue(m) => vec![
            int(m.enumeration_id),
            time(&m.timestamp),
            int(m.sequence_number),
            opt_uuid(m.compound_value_id),
            opt_text(m.value.as_deref()),
            uuid(m.mapping_id),
        ],
        Message::NumericValue(m) => vec![
            int(m.numeric_id),
            time(&m.timestamp),
            int(m.sequence_number),
            opt_bool(m.is_trend_uploaded),
            opt_uuid(m.compound_value_id),
            opt_display(m.value.as_ref()),
            uuid(m.mapping_id),
        ],
        Message::PatientMapping(m) => vec![
            uuid(m.mapping_id),
            uuid(m.patient_id),
            time(&m.timestamp),
            opt_bool(m.is_mapped),
            opt_text(m.hostname.as_deref()),
        ],
        Message::PatientBasicInfo(m) => vec![
            uuid(m.patient_id),
            time(&m.timestamp),
            opt_text(m.bed_label.as_deref()),
            opt_text(m.alias.as_deref()),
            opt_int(m.category),
            opt_display(m.height.as_ref()),
            opt_int(m.height_unit),
            opt_display(m.weight.as_ref()),
            opt_int(m.weight_unit),
            opt_int(m.pressure_unit),
            opt_int(m.paced_mode),
            opt_int(m.resuscitation_status),
            opt_int(m.admit_state),
            opt_text(m.clinical_unit.as_deref()),
            opt_int(m.gender),
        ],
        Message::PatientDateAttribute(m) => vec![
            uuid(m.patient_id),
            time(&m.timestamp),
            text(&m.name),
            opt_display(m.value.as_ref()),
        ],
        Message::PatientStringAttribute(m) => vec![
            uuid(m.patient_id),
            time(&m.timestamp),
            text(&m.name),
            opt_text(m.value.as_deref()),
        ],
        Message::BedTag(m) => vec![
            text(&m.bed_label),
            time(&m.timestamp),
            text(&m.tag),
        ],
    }
}

// ---------------------------------------------------------------------------
// Format descriptions
// ---------------------------------------------------------------------------

/// Source column names for each table, in row order.
pub fn column_names(kind: MessageKind) -> &'static [&'static str] {
    match kind {
        MessageKind::WaveSample => &[
            "WaveId",
            "TimeStamp",
            "SequenceNumber",
            "WaveSamples",
            "UnavailableSamples",
            "InvalidSamples",
            "PacedPulses",
            "MappingId",
        ],
        MessageKind::Alert => &[
            "TimeStamp",
            "SequenceNumber",
            "AlertId",
            "Source",
            "Code",
            "Label",
            "Severity",
            "Kind",
            "IsSilenced",
            "SubtypeId",
            "AnnounceTime",
            "OnsetTime",
            "EndTime",
            "MappingId",
        ],
        MessageKind::EnumerationValue => &[
            "EnumerationId",
            "TimeStamp",
            "SequenceNumber",
            "CompoundValueId",
            "Value",
            "MappingId",
        ],
        MessageKind::NumericValue => &[
            "NumericId",
            "TimeStamp",
            "SequenceNumber",
            "IsTrendUploaded",
            "CompoundValueId",
            "Value",
            "MappingId",
        ],
        MessageKind::PatientMapping => &["Id", "PatientId", "Timestamp", "IsMapped", "Hostname"],
        MessageKind::PatientBasicInfo => &[
            "Id",
            "Timestamp",
            "BedLabel",
            "Alias",
            "Category",
            "Height",
            "HeightUnit",
            "Weight",
            "WeightUnit",
            "PressureUnit",
            "PacedMode",
            "ResuscitationStatus",
            "AdmitState",
            "ClinicalUnit",
            "Gender",
        ],
        MessageKind::PatientDateAttribute => &["PatientId", "Timestamp", "Name", "Value"],
        MessageKind::PatientStringAttribute => &["PatientId", "Timestamp", "Name", "Value"],
        MessageKind::BedTag => &["BedLabel", "Timestamp", "Tag"],
    }
}

/// Generate the `.fmt` description for a message kind.
///
/// Column names are written in lowercase, matching freebcp's own output;
/// the reader matches them case-insensitively.
pub fn format_description(kind: MessageKind) -> String {
    let columns = column_names(kind);
    let mut out = format!("0.0\n{}\n", columns.len());
    let last = columns.len() - 1;
    for (i, name) in columns.iter().enumerate() {
        let storage = if *name == "WaveSamples" {
            " SYBBINARY 4 -1 \"\" ".to_owned()
        } else if i == last {
            " SYBCHAR 0 -1 \"\\n\" ".to_owned()
        } else {
            " SYBCHAR 0 -1 \"\\t\" ".to_owned()
        };
        out.push_str(&format!(
            "{}{}{} {} \"\"\n",
            i + 1,
            storage,
            i + 1,
            name.to_lowercase()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{format_description, format_message};
    use crate::message::{Message, MessageKind, Origin, WaveSampleMessage};
    use uuid::Uuid;

    fn wave_message() -> Message {
        Message::WaveSample(WaveSampleMessage {
            origin: Origin::new("test"),
            wave_id: 11,
            timestamp: "2017-03-01 12:00:00.000 +00:00".parse().unwrap(),
            sequence_number: 500_000_000_000,
            wave_samples: vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00],
            unavailable_samples: None,
            invalid_samples: None,
            paced_pulses: None,
            mapping_id: Uuid::nil(),
        })
    }

    #[test]
    fn wave_sample_row_layout() {
        let row = format_message(&wave_message());
        let mut expected = Vec::new();
        expected.extend_from_slice(b"11\t2017-03-01 12:00:00.000 +00:00\t500000000000\t");
        expected.extend_from_slice(&8u32.to_le_bytes());
        expected.extend_from_slice(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00]);
        expected.extend_from_slice(b"\t\t\t00000000-0000-0000-0000-000000000000\n");
        assert_eq!(row, expected);
    }

    #[test]
    fn wave_sample_format_description() {
        let fmt = format_description(MessageKind::WaveSample);
        let lines: Vec<&str> = fmt.lines().collect();
        assert_eq!(lines[0], "0.0");
        assert_eq!(lines[1], "8");
        assert_eq!(lines[2], "1 SYBCHAR 0 -1 \"\\t\" 1 waveid \"\"");
        assert_eq!(lines[5], "4 SYBBINARY 4 -1 \"\" 4 wavesamples \"\"");
        assert_eq!(lines[9], "8 SYBCHAR 0 -1 \"\\n\" 8 mappingid \"\"");
    }
}
