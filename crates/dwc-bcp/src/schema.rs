//! The DWC export schema and data-directory conventions.
//!
//! An export directory looks like:
//!
//! ```text
//! Alert.20010101_20010102        Alert.fmt
//! EnumerationValue.20010101_...  EnumerationValue.fmt
//! NumericValue.20010101_...      NumericValue.fmt
//! Patient.20010101_...           Patient.fmt
//! PatientDateAttribute....       PatientDateAttribute.fmt
//! PatientMapping....             PatientMapping.fmt
//! PatientStringAttribute....     PatientStringAttribute.fmt
//! WaveSample.20010101_...        WaveSample.fmt
//! BedTag.20010101_...            BedTag.fmt
//! Enumeration  Numeric  Wave     (+ .fmt)  <- metadata, period-independent
//! ```
//!
//! Dated files concatenate in sorted order; the metadata tables are
//! replaced by the most recently imported file.

use std::path::Path;

use crate::connection::Connection;
use crate::error::{BcpError, Result};
use crate::table::TableDefs;
use crate::value::ColumnType;

use ColumnType::{Binary, Boolean, DateTime, Integer, Number, String as Str, Uuid as Uid};

fn defs(
    columns: &[(&str, ColumnType)],
    order: Option<&str>,
    unique_ids: &[&str],
) -> TableDefs {
    TableDefs {
        columns: columns
            .iter()
            .map(|(n, t)| ((*n).to_owned(), *t))
            .collect(),
        order: order.map(str::to_owned),
        unique_ids: unique_ids.iter().map(|s| (*s).to_owned()).collect(),
    }
}

/// Declare every `_Export.*` table on a connection.
pub fn define_dwc_tables(conn: &mut Connection) {
    conn.define_table(
        "_Export.Alert_",
        defs(
            &[
                ("TimeStamp", DateTime),
                ("SequenceNumber", Integer),
                ("AlertId", Uid),
                ("Source", Integer),
                ("Code", Integer),
                ("Label", Str),
                ("Severity", Integer),
                ("Kind", Integer),
                ("IsSilenced", Boolean),
                ("SubtypeId", Integer),
                ("AnnounceTime", DateTime),
                ("OnsetTime", DateTime),
                ("EndTime", DateTime),
                ("MappingId", Uid),
            ],
            Some("TimeStamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.BedTag_",
        defs(
            &[
                ("BedLabel", Str),
                ("Timestamp", DateTime),
                ("Tag", Str),
            ],
            Some("Timestamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.Enumeration_",
        defs(
            &[
                ("Id", Integer),
                ("BasePhysioId", Integer),
                ("PhysioId", Integer),
                ("Label", Str),
                ("ValuePhysioId", Integer),
                ("IsAperiodic", Boolean),
                ("IsManual", Boolean),
                ("Validity", Integer),
                ("UnitCode", Integer),
                ("UnitLabel", Str),
                ("Color", Integer),
            ],
            Some("Id"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.EnumerationValue_",
        defs(
            &[
                ("EnumerationId", Integer),
                ("TimeStamp", DateTime),
                ("SequenceNumber", Integer),
                ("CompoundValueId", Uid),
                ("Value", Str),
                ("MappingId", Uid),
            ],
            Some("TimeStamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.Numeric_",
        defs(
            &[
                ("Id", Integer),
                ("BasePhysioId", Integer),
                ("PhysioId", Integer),
                ("Label", Str),
                ("IsAperiodic", Boolean),
                ("UnitLabel", Str),
                ("Validity", Integer),
                ("LowerLimit", Number),
                ("UpperLimit", Number),
                ("IsAlarmingOff", Boolean),
                ("SubPhysioId", Integer),
                ("SubLabel", Str),
                ("Color", Integer),
                ("IsManual", Boolean),
                ("MaxValues", Integer),
                ("Scale", Integer),
            ],
            Some("Id"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.NumericValue_",
        defs(
            &[
                ("NumericId", Integer),
                ("TimeStamp", DateTime),
                ("SequenceNumber", Integer),
                ("IsTrendUploaded", Boolean),
                ("CompoundValueId", Uid),
                ("Value", Number),
                ("MappingId", Uid),
            ],
            Some("TimeStamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.Patient_",
        defs(
            &[
                ("Id", Uid),
                ("Timestamp", DateTime),
                ("BedLabel", Str),
                ("Alias", Str),
                ("Category", Integer),
                ("Height", Number),
                ("HeightUnit", Integer),
                ("Weight", Number),
                ("WeightUnit", Integer),
                ("PressureUnit", Integer),
                ("PacedMode", Integer),
                ("ResuscitationStatus", Integer),
                ("AdmitState", Integer),
                ("ClinicalUnit", Str),
                ("Gender", Integer),
            ],
            Some("Timestamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.PatientDateAttribute_",
        defs(
            &[
                ("PatientId", Uid),
                ("Timestamp", DateTime),
                ("Name", Str),
                ("Value", Str),
            ],
            Some("Timestamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.PatientStringAttribute_",
        defs(
            &[
                ("PatientId", Uid),
                ("Timestamp", DateTime),
                ("Name", Str),
                ("Value", Str),
            ],
            Some("Timestamp"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.PatientMapping_",
        defs(
            &[
                ("Id", Uid),
                ("PatientId", Uid),
                ("Timestamp", DateTime),
                ("IsMapped", Boolean),
                ("Hostname", Str),
            ],
            Some("Timestamp"),
            &["Id"],
        ),
    );
    conn.define_table(
        "_Export.Wave_",
        defs(
            &[
                ("Id", Integer),
                ("BasePhysioId", Integer),
                ("PhysioId", Integer),
                ("Label", Str),
                ("Channel", Integer),
                ("SamplePeriod", Integer),
                ("IsSlowWave", Boolean),
                ("IsDerived", Boolean),
                ("Color", Integer),
                ("LowEdgeFrequency", Number),
                ("HighEdgeFrequency", Number),
                ("ScaleLower", Integer),
                ("ScaleUpper", Integer),
                ("CalibrationScaledLower", Integer),
                ("CalibrationScaledUpper", Integer),
                ("CalibrationAbsLower", Number),
                ("CalibrationAbsUpper", Number),
                ("CalibrationType", Integer),
                ("UnitLabel", Str),
                ("UnitCode", Integer),
                ("EcgLeadPlacement", Integer),
            ],
            Some("Id"),
            &[],
        ),
    );
    conn.define_table(
        "_Export.WaveSample_",
        defs(
            &[
                ("WaveId", Integer),
                ("TimeStamp", DateTime),
                ("SequenceNumber", Integer),
                ("WaveSamples", Binary),
                ("UnavailableSamples", Str),
                ("InvalidSamples", Str),
                ("PacedPulses", Str),
                ("MappingId", Uid),
            ],
            Some("TimeStamp"),
            &[],
        ),
    );
}

/// Open a connection over one or more export directories.
pub fn connect<P: AsRef<Path>>(datadirs: &[P]) -> Result<Connection> {
    let mut conn = Connection::new();
    define_dwc_tables(&mut conn);
    for dir in datadirs {
        add_data_dir(&mut conn, dir.as_ref())?;
    }
    Ok(conn)
}

/// Import every recognizable data file from an export directory.
pub fn add_data_dir(conn: &mut Connection, dir: &Path) -> Result<()> {
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .map_err(|e| BcpError::Operational(format!("cannot read {}: {e}", dir.display())))?
    {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names.sort();

    for name in names {
        let base = name.split('.').next().unwrap_or("");
        let table = format!("_Export.{base}_");
        let path = dir.join(&name);
        let fmtpath = dir.join(format!("{base}.fmt"));
        if is_meta_file(&name) {
            conn.add_data_file(&table, &path, &fmtpath, true)?;
        } else if is_data_file(&name) {
            conn.add_data_file(&table, &path, &fmtpath, false)?;
        }
    }
    Ok(())
}

/// `Enumeration`, `Numeric`, `Wave` (optionally `.dat`): metadata files.
fn is_meta_file(name: &str) -> bool {
    matches!(
        name,
        "Enumeration" | "Numeric" | "Wave" | "Enumeration.dat" | "Numeric.dat" | "Wave.dat"
    )
}

/// `<Table>.dat` or `<Table>.YYYYMMDD_YYYYMMDD`: dated data files.
fn is_data_file(name: &str) -> bool {
    let Some((base, ext)) = name.rsplit_once('.') else {
        return false;
    };
    if base.is_empty() || !base.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }
    if ext == "dat" {
        return true;
    }
    matches!(ext.split_once('_'), Some((a, b))
        if !a.is_empty() && !b.is_empty()
            && a.bytes().all(|c| c.is_ascii_digit())
            && b.bytes().all(|c| c.is_ascii_digit()))
}
