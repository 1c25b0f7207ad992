//! Import pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::validate::{into_result, ValidationError};

/// Default bulk-copy flush threshold (64 KiB).
pub const DEFAULT_COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Smallest accepted flush threshold (4 KiB).
pub const MIN_COPY_CHUNK_BYTES: usize = 4 * 1024;

/// Largest accepted flush threshold (64 MiB).
pub const MAX_COPY_CHUNK_BYTES: usize = 64 * 1024 * 1024;

/// Default rows per conflict-ignore insert statement in fallback mode.
pub const DEFAULT_FALLBACK_BATCH_ROWS: usize = 15_000;

/// How datapoints reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Text rows streamed through the bulk-copy channel. Fails on duplicates.
    #[default]
    Streaming,
    /// Batched inserts that silently discard duplicate keys.
    Fallback,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Streaming => write!(f, "streaming"),
            LoadMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// What to do with a datapoint whose timestamp or value cannot be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorPolicy {
    /// Log the row with its context and continue.
    #[default]
    Skip,
    /// Abort the import on the first bad row.
    Fail,
}

/// How enumeration identifiers are assigned in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumStrategy {
    /// `enum_types` rows keyed by (instrument, name) plus `enum_values`.
    #[default]
    NaturalKey,
    /// Legacy `enumerations` table with per-instrument sequence numbers.
    Sequential,
}

impl std::fmt::Display for EnumStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnumStrategy::NaturalKey => write!(f, "natural_key"),
            EnumStrategy::Sequential => write!(f, "sequential"),
        }
    }
}

/// Knobs for one import run (`[import]` table of the config file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    /// Bytes buffered before each bulk-copy write.
    pub copy_chunk_bytes: usize,
    pub mode: LoadMode,
    pub fallback_batch_rows: usize,
    pub row_errors: RowErrorPolicy,
    pub enum_strategy: EnumStrategy,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            copy_chunk_bytes: DEFAULT_COPY_CHUNK_BYTES,
            mode: LoadMode::default(),
            fallback_batch_rows: DEFAULT_FALLBACK_BATCH_ROWS,
            row_errors: RowErrorPolicy::default(),
            enum_strategy: EnumStrategy::default(),
        }
    }
}

impl ImportConfig {
    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_copy_chunk_bytes(mut self, bytes: usize) -> Self {
        self.copy_chunk_bytes = bytes;
        self
    }

    pub fn with_row_errors(mut self, policy: RowErrorPolicy) -> Self {
        self.row_errors = policy;
        self
    }

    pub fn with_enum_strategy(mut self, strategy: EnumStrategy) -> Self {
        self.enum_strategy = strategy;
        self
    }

    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(MIN_COPY_CHUNK_BYTES..=MAX_COPY_CHUNK_BYTES).contains(&self.copy_chunk_bytes) {
            errors.push(ValidationError::new(
                "import.copy_chunk_bytes",
                format!(
                    "must be in [{MIN_COPY_CHUNK_BYTES}, {MAX_COPY_CHUNK_BYTES}], got {}",
                    self.copy_chunk_bytes
                ),
            ));
        }
        if self.fallback_batch_rows == 0 {
            errors.push(ValidationError::new(
                "import.fallback_batch_rows",
                "must be at least 1",
            ));
        }
        errors
    }

    pub fn validate(&self) -> crate::Result<()> {
        into_result(self.validation_errors())
    }
}
