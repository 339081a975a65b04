//! Converter configuration loading.
//!
//! The configuration file (historically called the "password file", and
//! still passed as `--password-file`) is TOML describing the known
//! servers and a few tunables:
//!
//! ```toml
//! schema_version = 1
//!
//! [converter]
//! messages_per_batch = 10000
//! patient_mapping_delay_ms = 600000
//! handler_workers = 0
//! pending_limit = 200
//!
//! [servers.demo]
//! data_dirs = ["/data/exports/demo"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub schema_version: u32,
    pub messages_per_batch: usize,
    /// How long a data queue waits for a patient mapping before giving
    /// up and filing under the mapping id.
    pub patient_mapping_delay_ms: i64,
    /// Number of handler worker processes; zero runs handlers in-process.
    pub handler_workers: usize,
    /// Parent-to-worker requests in flight before a forced sync.
    pub pending_limit: usize,
    pub servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dirs: Vec<PathBuf>,
}

impl ConverterConfig {
    pub fn server(&self, name: &str) -> Result<&ServerConfig, ConfigError> {
        self.servers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownServer(name.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    converter: Option<RawConverter>,
    servers: Option<BTreeMap<String, RawServer>>,
}

#[derive(Debug, Deserialize)]
struct RawConverter {
    messages_per_batch: Option<usize>,
    patient_mapping_delay_ms: Option<i64>,
    handler_workers: Option<usize>,
    pending_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    data_dirs: Option<Vec<PathBuf>>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{0}': {1}")]
    Io(PathBuf, std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("no server named {0:?} in the config file")]
    UnknownServer(String),
}

pub fn load_config(path: &Path) -> Result<ConverterConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    load_config_from_str(&text)
}

pub fn load_config_from_str(text: &str) -> Result<ConverterConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let converter = raw.converter.unwrap_or(RawConverter {
        messages_per_batch: None,
        patient_mapping_delay_ms: None,
        handler_workers: None,
        pending_limit: None,
    });
    let messages_per_batch = converter.messages_per_batch.unwrap_or(10_000);
    if messages_per_batch == 0 {
        return Err(ConfigError::InvalidValue(
            "messages_per_batch must be positive".to_owned(),
        ));
    }

    let mut servers = BTreeMap::new();
    for (name, server) in raw.servers.unwrap_or_default() {
        let data_dirs = server
            .data_dirs
            .ok_or_else(|| ConfigError::MissingField(format!("servers.{name}.data_dirs")))?;
        if data_dirs.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "servers.{name}.data_dirs must not be empty"
            )));
        }
        servers.insert(name, ServerConfig { data_dirs });
    }
    if servers.is_empty() {
        return Err(ConfigError::MissingField("servers".to_owned()));
    }

    Ok(ConverterConfig {
        schema_version,
        messages_per_batch,
        patient_mapping_delay_ms: converter.patient_mapping_delay_ms.unwrap_or(10 * 60_000),
        handler_workers: converter.handler_workers.unwrap_or(0),
        pending_limit: converter.pending_limit.unwrap_or(200),
        servers,
    })
}

#[cfg(test)]
mod tests {
    use super::{load_config_from_str, ConfigError};

    #[test]
    fn minimal_config_fills_defaults() {
        let config = load_config_from_str(
            "schema_version = 1\n[servers.demo]\ndata_dirs = [\"/tmp/demo\"]\n",
        )
        .expect("config");
        assert_eq!(config.messages_per_batch, 10_000);
        assert_eq!(config.handler_workers, 0);
        assert_eq!(config.pending_limit, 200);
        assert_eq!(
            config.server("demo").expect("server").data_dirs,
            vec![std::path::PathBuf::from("/tmp/demo")]
        );
        assert!(matches!(
            config.server("other"),
            Err(ConfigError::UnknownServer(_))
        ));
    }

    #[test]
    fn rejects_missing_or_bad_fields() {
        assert!(matches!(
            load_config_from_str("[servers.demo]\ndata_dirs = [\"/x\"]\n"),
            Err(ConfigError::MissingField(_))
        ));
        assert!(matches!(
            load_config_from_str("schema_version = 2\n[servers.d]\ndata_dirs = [\"/x\"]\n"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            load_config_from_str("schema_version = 1\n"),
            Err(ConfigError::MissingField(_))
        ));
        assert!(matches!(
            load_config_from_str("schema_version = 1\n[servers.d]\n"),
            Err(ConfigError::MissingField(_))
        ));
    }
}
