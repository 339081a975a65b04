//! Attribute records for waves, numerics, and enumerations.
//!
//! Attributes are immutable per id and are looked up through the message's
//! origin, then cached per server. An id that does not exist in the source
//! resolves to the corresponding `undefined_*()` value (all fields absent)
//! so that downstream code degrades instead of stalling forever.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::decimal::DwcDecimal;

/// `_Export.Wave_` (sans the id itself; contents are anonymized).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaveAttr {
    pub base_physio_id: Option<i64>,
    pub physio_id: Option<i64>,
    pub label: Option<String>,
    /// 0 = primary, 1 = secondary.
    pub channel: Option<i64>,
    /// Sequence-counter ticks per sample.
    pub sample_period: Option<i64>,
    pub is_slow_wave: Option<bool>,
    pub is_derived: Option<bool>,
    pub color: Option<i64>,
    /// Input bandpass cutoff frequencies.
    pub low_edge_frequency: Option<DwcDecimal>,
    pub high_edge_frequency: Option<DwcDecimal>,
    /// Range of sample values.
    pub scale_lower: Option<i64>,
    pub scale_upper: Option<i64>,
    /// Two reference sample values and their physical equivalents.
    pub calibration_scaled_lower: Option<i64>,
    pub calibration_scaled_upper: Option<i64>,
    pub calibration_abs_lower: Option<DwcDecimal>,
    pub calibration_abs_upper: Option<DwcDecimal>,
    pub calibration_type: Option<i64>,
    pub unit_label: Option<String>,
    pub unit_code: Option<i64>,
    pub ecg_lead_placement: Option<i64>,
}

/// A wave id that does not exist in the source.
pub fn undefined_wave() -> WaveAttr {
    WaveAttr {
        base_physio_id: None,
        physio_id: None,
        label: None,
        channel: None,
        sample_period: None,
        is_slow_wave: None,
        is_derived: None,
        color: None,
        low_edge_frequency: None,
        high_edge_frequency: None,
        scale_lower: None,
        scale_upper: None,
        calibration_scaled_lower: None,
        calibration_scaled_upper: None,
        calibration_abs_lower: None,
        calibration_abs_upper: None,
        calibration_type: None,
        unit_label: None,
        unit_code: None,
        ecg_lead_placement: None,
    }
}

impl PartialOrd for WaveAttr {
    fn partial_cmp(&self, other: &WaveAttr) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Signals sort by display rank (channel, then physio ids) within a
/// segment layout; the remaining fields only break ties so the order is
/// total.
impl Ord for WaveAttr {
    fn cmp(&self, other: &WaveAttr) -> Ordering {
        (&self.channel, &self.base_physio_id, &self.physio_id)
            .cmp(&(&other.channel, &other.base_physio_id, &other.physio_id))
            .then_with(|| self.label.cmp(&other.label))
            .then_with(|| self.sample_period.cmp(&other.sample_period))
            .then_with(|| self.is_slow_wave.cmp(&other.is_slow_wave))
            .then_with(|| self.is_derived.cmp(&other.is_derived))
            .then_with(|| self.color.cmp(&other.color))
            .then_with(|| self.low_edge_frequency.cmp(&other.low_edge_frequency))
            .then_with(|| self.high_edge_frequency.cmp(&other.high_edge_frequency))
            .then_with(|| self.scale_lower.cmp(&other.scale_lower))
            .then_with(|| self.scale_upper.cmp(&other.scale_upper))
            .then_with(|| {
                self.calibration_scaled_lower
                    .cmp(&other.calibration_scaled_lower)
            })
            .then_with(|| {
                self.calibration_scaled_upper
                    .cmp(&other.calibration_scaled_upper)
            })
            .then_with(|| self.calibration_abs_lower.cmp(&other.calibration_abs_lower))
            .then_with(|| self.calibration_abs_upper.cmp(&other.calibration_abs_upper))
            .then_with(|| self.calibration_type.cmp(&other.calibration_type))
            .then_with(|| self.unit_label.cmp(&other.unit_label))
            .then_with(|| self.unit_code.cmp(&other.unit_code))
            .then_with(|| self.ecg_lead_placement.cmp(&other.ecg_lead_placement))
    }
}

/// `_Export.Numeric_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericAttr {
    pub base_physio_id: Option<i64>,
    pub physio_id: Option<i64>,
    /// Category label, such as `NBP`.
    pub label: Option<String>,
    /// Aperiodic (like NBP) rather than periodic (like HR).
    pub is_aperiodic: Option<bool>,
    pub unit_label: Option<String>,
    pub validity: Option<i64>,
    pub lower_limit: Option<DwcDecimal>,
    pub upper_limit: Option<DwcDecimal>,
    pub is_alarming_off: Option<bool>,
    pub sub_physio_id: Option<i64>,
    /// Specific label, such as `NBPs`.
    pub sub_label: Option<String>,
    pub color: Option<i64>,
    pub is_manual: Option<bool>,
    pub max_values: Option<i64>,
    pub scale: Option<i64>,
}

/// A numeric id that does not exist in the source.
pub fn undefined_numeric() -> NumericAttr {
    NumericAttr {
        base_physio_id: None,
        physio_id: None,
        label: None,
        is_aperiodic: None,
        unit_label: None,
        validity: None,
        lower_limit: None,
        upper_limit: None,
        is_alarming_off: None,
        sub_physio_id: None,
        sub_label: None,
        color: None,
        is_manual: None,
        max_values: None,
        scale: None,
    }
}

/// `_Export.Enumeration_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumerationAttr {
    pub base_physio_id: Option<i64>,
    pub physio_id: Option<i64>,
    /// Description such as `Annot` or `RhySta`.
    pub label: Option<String>,
    pub value_physio_id: Option<i64>,
    pub is_aperiodic: Option<bool>,
    pub is_manual: Option<bool>,
    pub validity: Option<i64>,
    pub unit_code: Option<i64>,
    pub unit_label: Option<String>,
    pub color: Option<i64>,
}

/// An enumeration id that does not exist in the source.
pub fn undefined_enumeration() -> EnumerationAttr {
    EnumerationAttr {
        base_physio_id: None,
        physio_id: None,
        label: None,
        value_physio_id: None,
        is_aperiodic: None,
        is_manual: None,
        validity: None,
        unit_code: None,
        unit_label: None,
        color: None,
    }
}
