//! Row-level error types and the import error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::ParamId;
use crate::value::ValueType;

/// Where a failure sits in the import, and therefore how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A single row or value block is dropped; the import continues.
    RowLevel,
    /// Store rejected instrument/enumeration/parameter metadata.
    Metadata,
    /// The bulk load call failed as a whole.
    Load,
    /// Document or store could not be reached before any work started.
    Resource,
    /// Settings or configuration are invalid.
    Config,
}

impl ErrorCategory {
    /// Only row-level failures are swallowed at the row/block boundary.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorCategory::RowLevel)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::RowLevel => write!(f, "row_level"),
            ErrorCategory::Metadata => write!(f, "metadata"),
            ErrorCategory::Load => write!(f, "load"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Config => write!(f, "config"),
        }
    }
}

/// No known timestamp layout matched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported time format: {raw}")]
pub struct MalformedTimestamp {
    pub raw: String,
}

impl MalformedTimestamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

/// Raw value text cannot be read as the parameter's declared type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot convert '{raw_value}' to {expected} for param {param_id}")]
pub struct ValueConversionError {
    pub param_id: ParamId,
    pub raw_value: String,
    pub expected: ValueType,
}

/// Any failure that drops a single datapoint or value block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error(transparent)]
    Timestamp(#[from] MalformedTimestamp),

    #[error(transparent)]
    Value(#[from] ValueConversionError),

    #[error("parameter {param_id} not found")]
    UnknownParameter { param_id: ParamId },
}

impl RowError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::RowLevel
    }
}
