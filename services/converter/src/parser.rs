//! Query building and row decoding for each message kind.
//!
//! One parameterized query builder replaces the original's parser class
//! tower; the per-kind differences are the table, the time column
//! spelling, and the row decoder. Mandatory column failures abort the
//! row; optional failures are logged and the field nulled.

use chrono::NaiveDate;
use dwc_bcp::{Query, Relation, Value};
use dwc_core::attr::{EnumerationAttr, NumericAttr, WaveAttr};
use dwc_core::bcp::column_names;
use dwc_core::message::{
    AlertMessage, BedTagMessage, EnumerationValueMessage, Message, MessageKind,
    NumericValueMessage, Origin, PatientBasicInfoMessage, PatientDateAttributeMessage,
    PatientMappingMessage, PatientStringAttributeMessage, WaveSampleMessage,
};
use dwc_core::{DwcDecimal, DwcTimestamp};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// A row (or cell) that does not decode to the expected message shape.
#[derive(Debug, Error)]
#[error("in {table}: column {column} is not {expected}")]
pub struct RowSyntaxError {
    pub table: String,
    pub column: &'static str,
    pub expected: &'static str,
}

// ---------------------------------------------------------------------------
// Query building
// ---------------------------------------------------------------------------

/// Range and filter parameters for a message query.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub limit: Option<usize>,
    pub time_ge: Option<DwcTimestamp>,
    pub time_le: Option<DwcTimestamp>,
    pub time_lt: Option<DwcTimestamp>,
    pub reverse: bool,
    pub mapping_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
}

/// The name of a kind's time column (`TimeStamp` on the data tables,
/// `Timestamp` on the patient and bed tables).
pub fn time_column(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::WaveSample
        | MessageKind::Alert
        | MessageKind::EnumerationValue
        | MessageKind::NumericValue => "TimeStamp",
        _ => "Timestamp",
    }
}

/// Column holding the scoping patient id, where one exists.
fn patient_column(kind: MessageKind) -> Option<&'static str> {
    match kind {
        MessageKind::PatientBasicInfo => Some("Id"),
        MessageKind::PatientDateAttribute | MessageKind::PatientStringAttribute => {
            Some("PatientId")
        }
        _ => None,
    }
}

/// Column holding the scoping mapping id, where one exists.
fn mapping_column(kind: MessageKind) -> Option<&'static str> {
    match kind {
        MessageKind::WaveSample
        | MessageKind::Alert
        | MessageKind::EnumerationValue
        | MessageKind::NumericValue => Some("MappingId"),
        MessageKind::PatientMapping => Some("Id"),
        _ => None,
    }
}

/// Build the range query for one message kind.
pub fn message_query(kind: MessageKind, opts: &QueryOpts) -> Query {
    let time_col = time_column(kind);
    let columns: Vec<String> = column_names(kind).iter().map(|c| (*c).to_owned()).collect();
    let mut q = Query::select(kind.table(), columns).order_by(time_col, opts.reverse);
    if let Some(limit) = opts.limit {
        q = q.limit(limit);
    }
    if let Some(t) = opts.time_ge {
        q = q.constraint(time_col, Relation::Ge, Value::Time(t));
    }
    if let Some(t) = opts.time_le {
        q = q.constraint(time_col, Relation::Le, Value::Time(t));
    }
    if let Some(t) = opts.time_lt {
        q = q.constraint(time_col, Relation::Lt, Value::Time(t));
    }
    if let (Some(col), Some(id)) = (mapping_column(kind), opts.mapping_id) {
        q = q.constraint(col, Relation::Eq, Value::Uuid(id));
    }
    if let (Some(col), Some(id)) = (patient_column(kind), opts.patient_id) {
        q = q.constraint(col, Relation::Eq, Value::Uuid(id));
    }
    q
}

/// Query for one attribute row by id (`_Export.Wave_` and friends).
pub fn attr_query(table: &str, columns: &[&str], id: i64) -> Query {
    Query::select(
        table.to_owned(),
        columns.iter().map(|c| (*c).to_owned()).collect(),
    )
    .constraint("Id", Relation::Eq, Value::Int(id))
    .limit(2)
}

/// Query resolving one mapping id to its patient.
pub fn patient_mapping_lookup(mapping_id: Uuid) -> Query {
    message_query(
        MessageKind::PatientMapping,
        &QueryOpts {
            limit: Some(2),
            mapping_id: Some(mapping_id),
            ..QueryOpts::default()
        },
    )
}

// ---------------------------------------------------------------------------
// Cell decoding
// ---------------------------------------------------------------------------

struct RowReader<'a> {
    table: &'static str,
    row: &'a [Value],
    columns: &'static [&'static str],
    idx: usize,
}

impl<'a> RowReader<'a> {
    fn new(table: &'static str, columns: &'static [&'static str], row: &'a [Value]) -> Self {
        RowReader {
            table,
            row,
            columns,
            idx: 0,
        }
    }

    fn next_cell(&mut self) -> (&'a Value, &'static str) {
        let cell = self.row.get(self.idx).unwrap_or(&Value::Null);
        let name = self.columns.get(self.idx).copied().unwrap_or("?");
        self.idx += 1;
        (cell, name)
    }

    fn fail(&self, column: &'static str, expected: &'static str) -> RowSyntaxError {
        RowSyntaxError {
            table: self.table.to_owned(),
            column,
            expected,
        }
    }

    fn soft_fail(&self, column: &'static str, expected: &'static str) {
        warn!(
            "in {}: column {column} is not {expected}; treating as null",
            self.table
        );
    }

    fn int(&mut self) -> Result<i64, RowSyntaxError> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Int(v) => Ok(*v),
            _ => Err(self.fail(name, "an integer")),
        }
    }

    fn opt_int(&mut self) -> Option<i64> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Int(v) => Some(*v),
            Value::Null => None,
            _ => {
                self.soft_fail(name, "an integer");
                None
            }
        }
    }

    fn time(&mut self) -> Result<DwcTimestamp, RowSyntaxError> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Time(v) => Ok(*v),
            _ => Err(self.fail(name, "a timestamp")),
        }
    }

    fn opt_time(&mut self) -> Option<DwcTimestamp> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Time(v) => Some(*v),
            Value::Null => None,
            _ => {
                self.soft_fail(name, "a timestamp");
                None
            }
        }
    }

    fn uuid(&mut self) -> Result<Uuid, RowSyntaxError> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Uuid(v) => Ok(*v),
            _ => Err(self.fail(name, "a UUID")),
        }
    }

    fn opt_uuid(&mut self) -> Option<Uuid> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Uuid(v) => Some(*v),
            Value::Null => None,
            _ => {
                self.soft_fail(name, "a UUID");
                None
            }
        }
    }

    fn string(&mut self) -> Result<String, RowSyntaxError> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Str(v) => Ok(v.clone()),
            _ => Err(self.fail(name, "a string")),
        }
    }

    fn opt_string(&mut self) -> Option<String> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Str(v) => Some(v.clone()),
            Value::Null => None,
            _ => {
                self.soft_fail(name, "a string");
                None
            }
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, RowSyntaxError> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Bytes(v) => Ok(v.clone()),
            // A null blob reads back as an empty sample array.
            Value::Null => Ok(Vec::new()),
            _ => Err(self.fail(name, "a byte string")),
        }
    }

    fn opt_bool(&mut self) -> Option<bool> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Bool(v) => Some(*v),
            Value::Null => None,
            _ => {
                self.soft_fail(name, "a boolean");
                None
            }
        }
    }

    fn opt_decimal(&mut self) -> Option<DwcDecimal> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Number(v) => Some(v.clone()),
            Value::Null => None,
            _ => {
                self.soft_fail(name, "a decimal");
                None
            }
        }
    }

    fn opt_date(&mut self) -> Option<NaiveDate> {
        let (cell, name) = self.next_cell();
        match cell {
            Value::Str(v) => match parse_date(v) {
                Some(d) => Some(d),
                None => {
                    self.soft_fail(name, "a date");
                    None
                }
            },
            Value::Null => None,
            _ => {
                self.soft_fail(name, "a date");
                None
            }
        }
    }
}

/// Accepts `YYYY-MM-DD` optionally followed by a time-of-day (the source
/// stores dates as midnight timestamps).
fn parse_date(s: &str) -> Option<NaiveDate> {
    let date_part = s.split_whitespace().next()?;
    let mut it = date_part.split('-');
    let year: i32 = it.next()?.parse().ok()?;
    let month: u32 = it.next()?.parse().ok()?;
    let day: u32 = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

/// Decode one projected row (in [`column_names`] order) into a message.
pub fn decode_message(
    kind: MessageKind,
    origin: &Origin,
    row: &[Value],
) -> Result<Message, RowSyntaxError> {
    let origin = origin.clone();
    match kind {
        MessageKind::WaveSample => {
            let mut r = RowReader::new("_Export.WaveSample_", column_names(kind), row);
            Ok(Message::WaveSample(WaveSampleMessage {
                wave_id: r.int()?,
                timestamp: r.time()?,
                sequence_number: r.int()?,
                wave_samples: r.bytes()?,
                unavailable_samples: r.opt_string(),
                invalid_samples: r.opt_string(),
                paced_pulses: r.opt_string(),
                mapping_id: r.uuid()?,
                origin,
            }))
        }
        MessageKind::Alert => {
            let mut r = RowReader::new("_Export.Alert_", column_names(kind), row);
            Ok(Message::Alert(AlertMessage {
                timestamp: r.time()?,
                sequence_number: r.int()?,
                alert_id: r.opt_uuid(),
                source: r.opt_int(),
                code: r.opt_int(),
                label: r.string()?,
                severity: r.opt_int(),
                kind: r.opt_int(),
                is_silenced: r.opt_bool(),
                subtype_id: r.opt_int(),
                announce_time: r.opt_time(),
                onset_time: r.opt_time(),
                end_time: r.opt_time(),
                mapping_id: r.uuid()?,
                origin,
            }))
        }
        MessageKind::EnumerationValue => {
            let mut r = RowReader::new("_Export.EnumerationValue_", column_names(kind), row);
            Ok(Message::EnumerationValue(EnumerationValueMessage {
                enumeration_id: r.int()?,
                timestamp: r.time()?,
                sequence_number: r.int()?,
                compound_value_id: r.opt_uuid(),
                value: r.opt_string(),
                mapping_id: r.uuid()?,
                origin,
            }))
        }
        MessageKind::NumericValue => {
            let mut r = RowReader::new("_Export.NumericValue_", column_names(kind), row);
            Ok(Message::NumericValue(NumericValueMessage {
                numeric_id: r.int()?,
                timestamp: r.time()?,
                sequence_number: r.int()?,
                is_trend_uploaded: r.opt_bool(),
                compound_value_id: r.opt_uuid(),
                value: r.opt_decimal(),
                mapping_id: r.uuid()?,
                origin,
            }))
        }
        MessageKind::PatientMapping => {
            let mut r = RowReader::new("_Export.PatientMapping_", column_names(kind), row);
            Ok(Message::PatientMapping(PatientMappingMessage {
                mapping_id: r.uuid()?,
                patient_id: r.uuid()?,
                timestamp: r.time()?,
                is_mapped: r.opt_bool(),
                hostname: r.opt_string(),
                origin,
            }))
        }
        MessageKind::PatientBasicInfo => {
            let mut r = RowReader::new("_Export.Patient_", column_names(kind), row);
            Ok(Message::PatientBasicInfo(PatientBasicInfoMessage {
                patient_id: r.uuid()?,
                timestamp: r.time()?,
                bed_label: r.opt_string(),
                alias: r.opt_string(),
                category: r.opt_int(),
                height: r.opt_decimal(),
                height_unit: r.opt_int(),
                weight: r.opt_decimal(),
                weight_unit: r.opt_int(),
                pressure_unit: r.opt_int(),
                paced_mode: r.opt_int(),
                resuscitation_status: r.opt_int(),
                admit_state: r.opt_int(),
                clinical_unit: r.opt_string(),
                gender: r.opt_int(),
                origin,
            }))
        }
        MessageKind::PatientDateAttribute => {
            let mut r = RowReader::new("_Export.PatientDateAttribute_", column_names(kind), row);
            Ok(Message::PatientDateAttribute(PatientDateAttributeMessage {
                patient_id: r.uuid()?,
                timestamp: r.time()?,
                name: r.string()?,
                value: r.opt_date(),
                origin,
            }))
        }
        MessageKind::PatientStringAttribute => {
            let mut r = RowReader::new(
                "_Export.PatientStringAttribute_",
                column_names(kind),
                row,
            );
            Ok(Message::PatientStringAttribute(
                PatientStringAttributeMessage {
                    patient_id: r.uuid()?,
                    timestamp: r.time()?,
                    name: r.string()?,
                    value: r.opt_string(),
                    origin,
                },
            ))
        }
        MessageKind::BedTag => {
            let mut r = RowReader::new("_Export.BedTag_", column_names(kind), row);
            Ok(Message::BedTag(BedTagMessage {
                bed_label: r.string()?,
                timestamp: r.time()?,
                tag: r.string()?,
                origin,
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Attribute decoding
// ---------------------------------------------------------------------------

pub const WAVE_ATTR_COLUMNS: &[&str] = &[
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

pub const NUMERIC_ATTR_COLUMNS: &[&str] = &[
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

pub const ENUMERATION_ATTR_COLUMNS: &[&str] = &[
    "BasePhysioId",
    "PhysioId",
    "Label",
    "ValuePhysioId",
    "IsAperiodic",
    "IsManual",
    "Validity",
    "UnitCode",
    "UnitLabel",
    "Color",
];

pub fn decode_wave_attr(row: &[Value]) -> Result<WaveAttr, RowSyntaxError> {
    let mut r = RowReader::new("_Export.Wave_", WAVE_ATTR_COLUMNS, row);
    let base_physio_id = r.opt_int();
    let physio_id = r.opt_int();
    let label = r.opt_string();
    let channel = r.opt_int();
    // Sample period drives frame packing; everything else is
    // informational.
    let sample_period = Some(r.int()?);
    Ok(WaveAttr {
        base_physio_id,
        physio_id,
        label,
        channel,
        sample_period,
        is_slow_wave: r.opt_bool(),
        is_derived: r.opt_bool(),
        color: r.opt_int(),
        low_edge_frequency: r.opt_decimal(),
        high_edge_frequency: r.opt_decimal(),
        scale_lower: r.opt_int(),
        scale_upper: r.opt_int(),
        calibration_scaled_lower: r.opt_int(),
        calibration_scaled_upper: r.opt_int(),
        calibration_abs_lower: r.opt_decimal(),
        calibration_abs_upper: r.opt_decimal(),
        calibration_type: r.opt_int(),
        unit_label: r.opt_string(),
        unit_code: r.opt_int(),
        ecg_lead_placement: r.opt_int(),
    })
}

pub fn decode_numeric_attr(row: &[Value]) -> Result<NumericAttr, RowSyntaxError> {
    let mut r = RowReader::new("_Export.Numeric_", NUMERIC_ATTR_COLUMNS, row);
    Ok(NumericAttr {
        base_physio_id: r.opt_int(),
        physio_id: r.opt_int(),
        label: r.opt_string(),
        is_aperiodic: r.opt_bool(),
        unit_label: r.opt_string(),
        validity: r.opt_int(),
        lower_limit: r.opt_decimal(),
        upper_limit: r.opt_decimal(),
        is_alarming_off: r.opt_bool(),
        sub_physio_id: r.opt_int(),
        sub_label: r.opt_string(),
        color: r.opt_int(),
        is_manual: r.opt_bool(),
        max_values: r.opt_int(),
        scale: r.opt_int(),
    })
}

pub fn decode_enumeration_attr(row: &[Value]) -> Result<EnumerationAttr, RowSyntaxError> {
    let mut r = RowReader::new("_Export.Enumeration_", ENUMERATION_ATTR_COLUMNS, row);
    Ok(EnumerationAttr {
        base_physio_id: r.opt_int(),
        physio_id: r.opt_int(),
        label: r.opt_string(),
        value_physio_id: r.opt_int(),
        is_aperiodic: r.opt_bool(),
        is_manual: r.opt_bool(),
        validity: r.opt_int(),
        unit_code: r.opt_int(),
        unit_label: r.opt_string(),
        color: r.opt_int(),
    })
}
