//! Config file resolution.
//!
//! Lookup order: explicit CLI path → `HM_CONFIG` → XDG config dir →
//! built-in defaults. An explicit or env-named file must exist; a missing
//! XDG file silently falls back to defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::import::ImportConfig;
use crate::store::StoreConfig;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "HM_CONFIG";

/// Application directory under the XDG config dir.
pub const APP_DIR: &str = "hm-import";

/// Config file name inside `APP_DIR`.
pub const CONFIG_FILE: &str = "config.toml";

/// Complete configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HmConfig {
    pub import: ImportConfig,
    pub store: StoreConfig,
}

impl HmConfig {
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self> {
        let config: HmConfig = toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = self.import.validation_errors();
        errors.extend(self.store.validation_errors());
        crate::validate::into_result(errors)
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Env(PathBuf),
    Xdg(PathBuf),
    Defaults,
}

/// Candidate config locations.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub explicit: Option<PathBuf>,
    pub env: Option<PathBuf>,
    pub xdg: Option<PathBuf>,
}

impl ConfigPaths {
    /// Collect candidates from the CLI flag, environment, and XDG dirs.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            env: std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            xdg: dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE)),
        }
    }
}

/// Resolve and load the configuration.
pub fn resolve_config(paths: &ConfigPaths) -> Result<(HmConfig, ConfigSource)> {
    if let Some(path) = &paths.explicit {
        return load_required(path).map(|c| (c, ConfigSource::Explicit(path.clone())));
    }
    if let Some(path) = &paths.env {
        return load_required(path).map(|c| (c, ConfigSource::Env(path.clone())));
    }
    if let Some(path) = &paths.xdg {
        if path.is_file() {
            return HmConfig::load(path).map(|c| (c, ConfigSource::Xdg(path.clone())));
        }
        debug!(path = %path.display(), "no config file, using defaults");
    }
    Ok((HmConfig::default(), ConfigSource::Defaults))
}

fn load_required(path: &Path) -> Result<HmConfig> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    HmConfig::load(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::LoadMode;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_explicit_wins() {
        let dir = TempDir::new().unwrap();
        let explicit = write(&dir, "a.toml", "[import]\nmode = \"fallback\"\n");
        let env = write(&dir, "b.toml", "[import]\nmode = \"streaming\"\n");
        let paths = ConfigPaths {
            explicit: Some(explicit.clone()),
            env: Some(env),
            xdg: None,
        };
        let (config, source) = resolve_config(&paths).unwrap();
        assert_eq!(config.import.mode, LoadMode::Fallback);
        assert_eq!(source, ConfigSource::Explicit(explicit));
    }

    #[test]
    fn test_env_used_without_explicit() {
        let dir = TempDir::new().unwrap();
        let env = write(&dir, "b.toml", "[store]\nhost = \"db\"\nport = 6000\n");
        let paths = ConfigPaths {
            explicit: None,
            env: Some(env.clone()),
            xdg: None,
        };
        let (config, source) = resolve_config(&paths).unwrap();
        assert_eq!(config.store.host, "db");
        assert_eq!(config.store.port, 6000);
        assert_eq!(source, ConfigSource::Env(env));
    }

    #[test]
    fn test_missing_explicit_is_error() {
        let paths = ConfigPaths {
            explicit: Some(PathBuf::from("/nonexistent/hm.toml")),
            ..ConfigPaths::default()
        };
        assert!(matches!(
            resolve_config(&paths),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_xdg_falls_back() {
        let paths = ConfigPaths {
            xdg: Some(PathBuf::from("/nonexistent/hm-import/config.toml")),
            ..ConfigPaths::default()
        };
        let (config, source) = resolve_config(&paths).unwrap();
        assert_eq!(config, HmConfig::default());
        assert_eq!(source, ConfigSource::Defaults);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.toml", "[import]\ncopy_chunk_bytes = 10\n");
        let err = HmConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("import.copy_chunk_bytes"));
    }

    #[test]
    fn test_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.toml", "[import\n");
        assert!(matches!(
            HmConfig::load(&path),
            Err(ConfigError::Toml { .. })
        ));
    }
}
