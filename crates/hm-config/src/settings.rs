//! Instrument registry loaded from the settings JSON.
//!
//! The settings file is a JSON array with one entry per instrument:
//!
//! ```json
//! [{"instrument": "9999, Test Instrument", "serial": 9999,
//!   "model": "Test instrument", "name": "Test", "type": "tem",
//!   "template": "krios", "server": "127.0.0.1"}]
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use hm_common::InstrumentIdentity;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::validate::{into_result, ValidationError};

/// Known instruments, looked up by natural key.
#[derive(Debug, Clone)]
pub struct InstrumentRegistry {
    instruments: Vec<InstrumentIdentity>,
}

impl InstrumentRegistry {
    /// Build a registry, rejecting blank or duplicate natural keys.
    pub fn new(instruments: Vec<InstrumentIdentity>) -> Result<Self> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for (i, inst) in instruments.iter().enumerate() {
            if inst.instrument.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("[{i}].instrument"),
                    "must not be empty",
                ));
            } else if !seen.insert(inst.instrument.as_str()) {
                errors.push(ValidationError::new(
                    format!("[{i}].instrument"),
                    format!("duplicate instrument '{}'", inst.instrument),
                ));
            }
        }
        into_result(errors)?;
        Ok(Self { instruments })
    }

    /// Parse settings JSON text.
    pub fn from_json(json: &str, origin: &Path) -> Result<Self> {
        let instruments: Vec<InstrumentIdentity> =
            serde_json::from_str(json).map_err(|source| ConfigError::Json {
                path: origin.to_path_buf(),
                source,
            })?;
        if instruments.is_empty() {
            return Err(ConfigError::EmptySettings(origin.to_path_buf()));
        }
        Self::new(instruments)
    }

    /// Load a `.json` settings file.
    pub fn load(path: &Path) -> Result<Self> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(ConfigError::NotJson(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json(&content, path)?;
        debug!(
            path = %path.display(),
            instruments = registry.len(),
            "loaded instrument settings"
        );
        Ok(registry)
    }

    pub fn find(&self, instrument: &str) -> Option<&InstrumentIdentity> {
        self.instruments.iter().find(|i| i.instrument == instrument)
    }

    /// Like `find`, but a miss is an error.
    pub fn require(&self, instrument: &str) -> Result<&InstrumentIdentity> {
        self.find(instrument)
            .ok_or_else(|| ConfigError::UnknownInstrument(instrument.to_string()))
    }

    pub fn find_by_serial(&self, serial: i64) -> Option<&InstrumentIdentity> {
        self.instruments.iter().find(|i| i.serial == serial)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentIdentity> {
        self.instruments.iter()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::DatabaseKind;
    use std::io::Write;
    use tempfile::TempDir;

    const SETTINGS: &str = r#"[
        {"instrument": "9999, Test Instrument", "serial": 9999, "model": "Test instrument",
         "name": "Test", "type": "tem", "template": "krios", "server": "127.0.0.1"},
        {"instrument": "4242, Other", "serial": 4242, "model": "Apreo",
         "name": "Other", "type": "sem", "template": "apreo", "server": "10.0.0.2"}
    ]"#;

    #[test]
    fn test_load_and_find() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::File::create(&path)
            .unwrap()
            .write_all(SETTINGS.as_bytes())
            .unwrap();

        let registry = InstrumentRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        let inst = registry.find("9999, Test Instrument").unwrap();
        assert_eq!(inst.model, "Test instrument");
        assert_eq!(
            registry.find_by_serial(4242).unwrap().database,
            DatabaseKind::Sem
        );
        assert!(matches!(
            registry.require("missing"),
            Err(ConfigError::UnknownInstrument(_))
        ));
    }

    #[test]
    fn test_rejects_non_json_extension() {
        let err = InstrumentRegistry::load(Path::new("/tmp/settings.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotJson(_)));
    }

    #[test]
    fn test_rejects_empty_list() {
        let err = InstrumentRegistry::from_json("[]", Path::new("s.json")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySettings(_)));
    }

    #[test]
    fn test_rejects_duplicates() {
        let one = r#"{"instrument": "A", "serial": 1, "model": "m", "name": "n",
                      "type": "tem", "template": "t", "server": "s"}"#;
        let json = format!("[{one}, {one}]");
        let err = InstrumentRegistry::from_json(&json, Path::new("s.json")).unwrap_err();
        assert!(err.to_string().contains("duplicate instrument 'A'"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = InstrumentRegistry::load(Path::new("/nonexistent/settings.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
