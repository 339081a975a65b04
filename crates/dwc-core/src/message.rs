//! Typed message records, one per export table row.
//!
//! Field sets mirror the `_Export.*` tables column for column. Every
//! message carries an [`Origin`] naming the server it came from; the origin
//! is a lookup key, not a live connection: attribute and patient-mapping
//! lookups go through the per-server catalog owned by whoever holds the
//! message.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::DwcDecimal;
use crate::time::DwcTimestamp;

// ---------------------------------------------------------------------------
// Origin and channels
// ---------------------------------------------------------------------------

/// Back-pointer to the data source a message was read from.
///
/// Deliberately just the server name: cheap to clone, stable across
/// process boundaries, and usable as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub server: String,
}

impl Origin {
    pub fn new(server: impl Into<String>) -> Origin {
        Origin {
            server: server.into(),
        }
    }
}

/// Dispatcher routing key.
///
/// Messages are unique within a channel; `(channel, message)` is the
/// dispatcher identity for ack/nack/replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// Streams scoped to a bed-to-patient mapping (waves, numerics, ...).
    Mapping(Uuid),
    /// Streams scoped to a patient (basic info, attributes).
    Patient(Uuid),
    /// Bed-level streams with no narrower scope.
    Bed,
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The export table a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    WaveSample,
    Alert,
    EnumerationValue,
    NumericValue,
    PatientMapping,
    PatientBasicInfo,
    PatientDateAttribute,
    PatientStringAttribute,
    BedTag,
}

impl MessageKind {
    /// Short table name, e.g. `WaveSample`.
    pub fn abbr(self) -> &'static str {
        match self {
            MessageKind::WaveSample => "WaveSample",
            MessageKind::Alert => "Alert",
            MessageKind::EnumerationValue => "EnumerationValue",
            MessageKind::NumericValue => "NumericValue",
            MessageKind::PatientMapping => "PatientMapping",
            MessageKind::PatientBasicInfo => "Patient",
            MessageKind::PatientDateAttribute => "PatientDateAttribute",
            MessageKind::PatientStringAttribute => "PatientStringAttribute",
            MessageKind::BedTag => "BedTag",
        }
    }

    /// Full table name, e.g. `_Export.WaveSample_`.
    pub fn table(self) -> String {
        format!("_Export.{}_", self.abbr())
    }
}

// ---------------------------------------------------------------------------
// Per-table message records
// ---------------------------------------------------------------------------

/// `_Export.WaveSample_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaveSampleMessage {
    pub origin: Origin,
    /// Opaque id of the waveform attributes (assumed immutable per id).
    pub wave_id: i64,
    pub timestamp: DwcTimestamp,
    /// Uniform counter of milliseconds; never adjusted with the wall clock.
    pub sequence_number: i64,
    /// Samples as 16-bit little-endian unsigned integers.
    pub wave_samples: Vec<u8>,
    /// Space-separated inclusive index pairs of unavailable intervals.
    pub unavailable_samples: Option<String>,
    /// Space-separated inclusive index pairs of invalid intervals.
    /// Kept independent of `unavailable_samples`; the two are not known
    /// to be interchangeable.
    pub invalid_samples: Option<String>,
    /// Space-separated relative sample numbers of pacemaker pulses.
    pub paced_pulses: Option<String>,
    pub mapping_id: Uuid,
}

/// `_Export.Alert_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertMessage {
    pub origin: Origin,
    pub timestamp: DwcTimestamp,
    pub sequence_number: i64,
    pub alert_id: Option<Uuid>,
    pub source: Option<i64>,
    pub code: Option<i64>,
    pub label: String,
    pub severity: Option<i64>,
    pub kind: Option<i64>,
    pub is_silenced: Option<bool>,
    pub subtype_id: Option<i64>,
    /// Time the alarm was reported. Absurd values (year 1) mean unknown.
    pub announce_time: Option<DwcTimestamp>,
    pub onset_time: Option<DwcTimestamp>,
    pub end_time: Option<DwcTimestamp>,
    pub mapping_id: Uuid,
}

/// `_Export.EnumerationValue_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumerationValueMessage {
    pub origin: Origin,
    pub enumeration_id: i64,
    pub timestamp: DwcTimestamp,
    pub sequence_number: i64,
    pub compound_value_id: Option<Uuid>,
    pub value: Option<String>,
    pub mapping_id: Uuid,
}

/// `_Export.NumericValue_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericValueMessage {
    pub origin: Origin,
    pub numeric_id: i64,
    pub timestamp: DwcTimestamp,
    pub sequence_number: i64,
    pub is_trend_uploaded: Option<bool>,
    pub compound_value_id: Option<Uuid>,
    /// Measurement value, preserved in its exact source text form.
    pub value: Option<DwcDecimal>,
    pub mapping_id: Uuid,
}

/// `_Export.PatientMapping_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientMappingMessage {
    pub origin: Origin,
    /// The `Id` column: the per-admission mapping id.
    pub mapping_id: Uuid,
    pub patient_id: Uuid,
    pub timestamp: DwcTimestamp,
    pub is_mapped: Option<bool>,
    pub hostname: Option<String>,
}

/// `_Export.Patient_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientBasicInfoMessage {
    pub origin: Origin,
    pub patient_id: Uuid,
    pub timestamp: DwcTimestamp,
    pub bed_label: Option<String>,
    pub alias: Option<String>,
    pub category: Option<i64>,
    pub height: Option<DwcDecimal>,
    pub height_unit: Option<i64>,
    pub weight: Option<DwcDecimal>,
    pub weight_unit: Option<i64>,
    pub pressure_unit: Option<i64>,
    pub paced_mode: Option<i64>,
    pub resuscitation_status: Option<i64>,
    pub admit_state: Option<i64>,
    pub clinical_unit: Option<String>,
    pub gender: Option<i64>,
}

/// `_Export.PatientDateAttribute_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientDateAttributeMessage {
    pub origin: Origin,
    pub patient_id: Uuid,
    pub timestamp: DwcTimestamp,
    pub name: String,
    pub value: Option<NaiveDate>,
}

/// `_Export.PatientStringAttribute_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientStringAttributeMessage {
    pub origin: Origin,
    pub patient_id: Uuid,
    pub timestamp: DwcTimestamp,
    pub name: String,
    pub value: Option<String>,
}

/// `_Export.BedTag_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BedTagMessage {
    pub origin: Origin,
    pub bed_label: String,
    pub timestamp: DwcTimestamp,
    pub tag: String,
}

// ---------------------------------------------------------------------------
// The tagged union
// ---------------------------------------------------------------------------

/// Any message from the export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    WaveSample(WaveSampleMessage),
    Alert(AlertMessage),
    EnumerationValue(EnumerationValueMessage),
    NumericValue(NumericValueMessage),
    PatientMapping(PatientMappingMessage),
    PatientBasicInfo(PatientBasicInfoMessage),
    PatientDateAttribute(PatientDateAttributeMessage),
    PatientStringAttribute(PatientStringAttributeMessage),
    BedTag(BedTagMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::WaveSample(_) => MessageKind::WaveSample,
            Message::Alert(_) => MessageKind::Alert,
            Message::EnumerationValue(_) => MessageKind::EnumerationValue,
            Message::NumericValue(_) => MessageKind::NumericValue,
            Message::PatientMapping(_) => MessageKind::PatientMapping,
            Message::PatientBasicInfo(_) => MessageKind::PatientBasicInfo,
            Message::PatientDateAttribute(_) => MessageKind::PatientDateAttribute,
            Message::PatientStringAttribute(_) => MessageKind::PatientStringAttribute,
            Message::BedTag(_) => MessageKind::BedTag,
        }
    }

    pub fn origin(&self) -> &Origin {
        match self {
            Message::WaveSample(m) => &m.origin,
            Message::Alert(m) => &m.origin,
            Message::EnumerationValue(m) => &m.origin,
            Message::NumericValue(m) => &m.origin,
            Message::PatientMapping(m) => &m.origin,
            Message::PatientBasicInfo(m) => &m.origin,
            Message::PatientDateAttribute(m) => &m.origin,
            Message::PatientStringAttribute(m) => &m.origin,
            Message::BedTag(m) => &m.origin,
        }
    }

    pub fn timestamp(&self) -> DwcTimestamp {
        match self {
            Message::WaveSample(m) => m.timestamp,
            Message::Alert(m) => m.timestamp,
            Message::EnumerationValue(m) => m.timestamp,
            Message::NumericValue(m) => m.timestamp,
            Message::PatientMapping(m) => m.timestamp,
            Message::PatientBasicInfo(m) => m.timestamp,
            Message::PatientDateAttribute(m) => m.timestamp,
            Message::PatientStringAttribute(m) => m.timestamp,
            Message::BedTag(m) => m.timestamp,
        }
    }

    /// The mapping id, for mapping-scoped message kinds.
    pub fn mapping_id(&self) -> Option<Uuid> {
        match self {
            Message::WaveSample(m) => Some(m.mapping_id),
            Message::Alert(m) => Some(m.mapping_id),
            Message::EnumerationValue(m) => Some(m.mapping_id),
            Message::NumericValue(m) => Some(m.mapping_id),
            Message::PatientMapping(m) => Some(m.mapping_id),
            _ => None,
        }
    }

    /// The patient id, for patient-scoped message kinds.
    pub fn patient_id(&self) -> Option<Uuid> {
        match self {
            Message::PatientMapping(m) => Some(m.patient_id),
            Message::PatientBasicInfo(m) => Some(m.patient_id),
            Message::PatientDateAttribute(m) => Some(m.patient_id),
            Message::PatientStringAttribute(m) => Some(m.patient_id),
            _ => None,
        }
    }

    pub fn sequence_number(&self) -> Option<i64> {
        match self {
            Message::WaveSample(m) => Some(m.sequence_number),
            Message::Alert(m) => Some(m.sequence_number),
            Message::EnumerationValue(m) => Some(m.sequence_number),
            Message::NumericValue(m) => Some(m.sequence_number),
            _ => None,
        }
    }
}
