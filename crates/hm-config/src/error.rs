//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

use crate::validate::ValidationError;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("settings file must be a .json file: {0}")]
    NotJson(PathBuf),

    #[error("settings file {0} lists no instruments")]
    EmptySettings(PathBuf),

    #[error("instrument '{0}' not found in settings")]
    UnknownInstrument(String),

    #[error("POSTGRES_PASSWORD is not set")]
    MissingPassword,

    #[error("invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
