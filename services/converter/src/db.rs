//! The per-server data source: the BCP connection plus attribute and
//! patient-mapping caches.
//!
//! Attributes are immutable per id, so lookups are cached for the life of
//! the process. An id with no row resolves to the undefined attribute (so
//! a broken export cannot stall conversion); a row that fails to decode
//! is logged and also resolves to undefined. The cache is process-local:
//! each handler worker builds its own copy.
//!
//! Attribute and mapping lookups use a connection separate from the bulk
//! extraction connection, so their random seeks do not disturb the
//! extraction cursors' forward positions.

use std::collections::HashMap;
use std::path::PathBuf;

use dwc_bcp::{schema, BcpError, Connection, Query, Row};
use dwc_core::attr::{
    undefined_enumeration, undefined_numeric, undefined_wave, EnumerationAttr, NumericAttr,
    WaveAttr,
};
use dwc_core::message::MessageKind;
use tracing::warn;
use uuid::Uuid;

use crate::parser::{
    attr_query, decode_enumeration_attr, decode_numeric_attr, decode_wave_attr,
    patient_mapping_lookup, ENUMERATION_ATTR_COLUMNS, NUMERIC_ATTR_COLUMNS, WAVE_ATTR_COLUMNS,
};

pub struct DwcDb {
    servername: String,
    datadirs: Vec<PathBuf>,
    conn: Connection,
    attr_conn: Connection,
    wave_attr: HashMap<i64, WaveAttr>,
    numeric_attr: HashMap<i64, NumericAttr>,
    enumeration_attr: HashMap<i64, EnumerationAttr>,
    patient_map: HashMap<Uuid, Uuid>,
}

impl DwcDb {
    /// Open the export directories for one server.
    pub fn open(servername: impl Into<String>, datadirs: Vec<PathBuf>) -> Result<DwcDb, BcpError> {
        let conn = schema::connect(&datadirs)?;
        let attr_conn = schema::connect(&datadirs)?;
        Ok(DwcDb {
            servername: servername.into(),
            datadirs,
            conn,
            attr_conn,
            wave_attr: HashMap::new(),
            numeric_attr: HashMap::new(),
            enumeration_attr: HashMap::new(),
            patient_map: HashMap::new(),
        })
    }

    pub fn servername(&self) -> &str {
        &self.servername
    }

    pub fn datadirs(&self) -> &[PathBuf] {
        &self.datadirs
    }

    /// Run a bulk extraction query.
    pub fn execute(&mut self, query: &Query) -> Result<Vec<Row>, BcpError> {
        self.conn.execute(query)
    }

    // -----------------------------------------------------------------------
    // Attribute lookups
    // -----------------------------------------------------------------------

    pub fn get_wave_attr(&mut self, wave_id: i64) -> Result<WaveAttr, BcpError> {
        if let Some(attr) = self.wave_attr.get(&wave_id) {
            return Ok(attr.clone());
        }
        let query = attr_query("_Export.Wave_", WAVE_ATTR_COLUMNS, wave_id);
        let attr = match self.lookup_single(&query, "wave", wave_id)? {
            Some(row) => match decode_wave_attr(&row) {
                Ok(attr) => attr,
                Err(e) => {
                    warn!("{e}");
                    undefined_wave()
                }
            },
            None => undefined_wave(),
        };
        self.wave_attr.insert(wave_id, attr.clone());
        Ok(attr)
    }

    pub fn get_numeric_attr(&mut self, numeric_id: i64) -> Result<NumericAttr, BcpError> {
        if let Some(attr) = self.numeric_attr.get(&numeric_id) {
            return Ok(attr.clone());
        }
        let query = attr_query("_Export.Numeric_", NUMERIC_ATTR_COLUMNS, numeric_id);
        let attr = match self.lookup_single(&query, "numeric", numeric_id)? {
            Some(row) => match decode_numeric_attr(&row) {
                Ok(attr) => attr,
                Err(e) => {
                    warn!("{e}");
                    undefined_numeric()
                }
            },
            None => undefined_numeric(),
        };
        self.numeric_attr.insert(numeric_id, attr.clone());
        Ok(attr)
    }

    pub fn get_enumeration_attr(
        &mut self,
        enumeration_id: i64,
    ) -> Result<EnumerationAttr, BcpError> {
        if let Some(attr) = self.enumeration_attr.get(&enumeration_id) {
            return Ok(attr.clone());
        }
        let query = attr_query(
            "_Export.Enumeration_",
            ENUMERATION_ATTR_COLUMNS,
            enumeration_id,
        );
        let attr = match self.lookup_single(&query, "enumeration", enumeration_id)? {
            Some(row) => match decode_enumeration_attr(&row) {
                Ok(attr) => attr,
                Err(e) => {
                    warn!("{e}");
                    undefined_enumeration()
                }
            },
            None => undefined_enumeration(),
        };
        self.enumeration_attr.insert(enumeration_id, attr.clone());
        Ok(attr)
    }

    // -----------------------------------------------------------------------
    // Patient mapping
    // -----------------------------------------------------------------------

    /// Resolve a mapping id to its patient, consulting the mapping table
    /// on a cache miss. Unresolvable ids are not cached (the mapping row
    /// may simply not have arrived yet).
    pub fn get_patient_id(&mut self, mapping_id: Uuid) -> Result<Option<Uuid>, BcpError> {
        if let Some(pid) = self.patient_map.get(&mapping_id) {
            return Ok(Some(*pid));
        }
        let query = patient_mapping_lookup(mapping_id);
        let Some(row) = self.lookup_single(&query, "mapping", 0)? else {
            return Ok(None);
        };
        // Row layout: Id, PatientId, ...
        let Some(dwc_bcp::Value::Uuid(pid)) = row.get(1) else {
            warn!("patient mapping {mapping_id} has no decodable patient id");
            return Ok(None);
        };
        self.patient_map.insert(mapping_id, *pid);
        Ok(Some(*pid))
    }

    /// Record a mapping learned from a PatientMapping message.
    pub fn set_patient_id(&mut self, mapping_id: Uuid, patient_id: Uuid) {
        self.patient_map.insert(mapping_id, patient_id);
    }

    fn lookup_single(
        &mut self,
        query: &Query,
        what: &str,
        id: i64,
    ) -> Result<Option<Row>, BcpError> {
        let mut rows = self.attr_conn.execute(query)?;
        if rows.len() > 1 {
            warn!("multiple {what} rows found for id {id}");
        }
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }
}

/// Convenience used in tests and tools: the tables a data directory must
/// carry to resolve every message kind.
pub fn all_message_kinds() -> [MessageKind; 9] {
    [
        MessageKind::WaveSample,
        MessageKind::Alert,
        MessageKind::EnumerationValue,
        MessageKind::NumericValue,
        MessageKind::PatientMapping,
        MessageKind::PatientBasicInfo,
        MessageKind::PatientDateAttribute,
        MessageKind::PatientStringAttribute,
        MessageKind::BedTag,
    ]
}
