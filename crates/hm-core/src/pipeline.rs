//! Import pipeline: one document, one transaction.
//!
//! ```text
//! open ─► enumerations ─► instrument/parameters ─► begin
//!     ─► upsert metadata ─► value stream ─► bulk load ─► commit
//! ```
//!
//! Opening and extraction happen before any store work, so a missing or
//! malformed document never touches the store. Any fatal error after `begin`
//! rolls the transaction back before it propagates.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use hm_common::{
    EnumerationTable, ErrorCategory, InstrumentIdentity, InstrumentRef, ParamId, ParameterTable,
    RowError,
};
use hm_config::{ConfigError, ImportConfig, InstrumentRegistry, LoadMode};
use hm_store::{BulkLoader, CountScope, LoadError, LoadReport, StoreError, StoreGateway};

use crate::document::{open_document, DocumentCursor, DocumentError};
use crate::exit_codes::ExitCode;
use crate::extract::{extract_enumerations, extract_instrument};
use crate::resolve::MetadataResolver;
use crate::stream::{StreamError, StreamStats, ValueStream};

/// A fatal import failure.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Row-level failure under the strict row policy.
    #[error("row rejected (param {param_id}, timestamp '{raw_timestamp}', value '{raw_value}'): {source}")]
    RowRejected {
        param_id: ParamId,
        raw_timestamp: String,
        raw_value: String,
        #[source]
        source: RowError,
    },

    #[error("metadata upsert failed: {0}")]
    Metadata(#[source] StoreError),

    #[error("bulk load failed: {0}")]
    Load(#[source] LoadError),

    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl ImportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ImportError::Config(_) => ErrorCategory::Config,
            ImportError::Document(_) | ImportError::Store(_) => ErrorCategory::Resource,
            ImportError::RowRejected { .. } => ErrorCategory::RowLevel,
            ImportError::Metadata(_) => ErrorCategory::Metadata,
            ImportError::Load(_) => ErrorCategory::Load,
        }
    }

    /// Stable numeric code, grouped in decades by category.
    pub fn code(&self) -> u16 {
        match self {
            ImportError::RowRejected { .. } => 10,
            ImportError::Metadata(_) => 20,
            ImportError::Load(LoadError::DuplicateKey(_)) => 30,
            ImportError::Load(_) => 31,
            ImportError::Document(DocumentError::NotFound(_)) => 40,
            ImportError::Document(DocumentError::Io { .. }) => 41,
            ImportError::Document(DocumentError::UnsupportedFormat(_)) => 42,
            ImportError::Document(DocumentError::NotGzip(_)) => 43,
            ImportError::Document(_) => 44,
            ImportError::Store(_) => 45,
            ImportError::Config(_) => 50,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            ImportError::Document(_) | ImportError::RowRejected { .. } => ExitCode::DocumentError,
            ImportError::Store(_) => ExitCode::StoreError,
            other => ExitCode::from(other.category()),
        }
    }

    /// Unwrap stream failures that surfaced through the loader.
    fn from_load(e: LoadError) -> Self {
        let source = match e {
            LoadError::Source(source) => source,
            other => return ImportError::Load(other),
        };
        match source.downcast::<StreamError>() {
            Ok(stream) => match *stream {
                StreamError::Document(d) => ImportError::Document(d),
                StreamError::Row {
                    param_id,
                    raw_timestamp,
                    raw_value,
                    source,
                } => ImportError::RowRejected {
                    param_id,
                    raw_timestamp,
                    raw_value,
                    source,
                },
            },
            Err(other) => ImportError::Load(LoadError::Source(other)),
        }
    }
}

/// Summary of one imported document.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub source: String,
    pub instrument: InstrumentRef,
    pub serial: i64,
    pub enumerations: usize,
    pub parameters: usize,
    pub parameters_inserted: u64,
    pub rows_yielded: u64,
    pub rows_dropped: u64,
    pub blocks_skipped: u64,
    pub load: LoadReport,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl ImportReport {
    /// Authoritative datapoint count for the instrument after the load.
    pub fn stored_rows(&self) -> u64 {
        self.load.stored_rows
    }

    pub fn mode(&self) -> LoadMode {
        self.load.mode
    }

    /// No datapoints or value blocks were dropped.
    pub fn is_clean(&self) -> bool {
        self.rows_dropped == 0 && self.blocks_skipped == 0
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A document with its metadata extracted and its instrument identified,
/// positioned before the value blocks.
pub struct PreparedImport<R> {
    source: String,
    cursor: DocumentCursor<R>,
    enumerations: EnumerationTable,
    parameters: ParameterTable,
    identity: InstrumentIdentity,
}

impl PreparedImport<Box<dyn BufRead>> {
    /// Open `path` and read its metadata sections.
    pub fn open(path: &Path, registry: &InstrumentRegistry) -> Result<Self, ImportError> {
        let cursor = open_document(path)?;
        Self::from_cursor(cursor, registry, path.display().to_string())
    }
}

impl<R: BufRead> PreparedImport<R> {
    pub fn from_cursor(
        mut cursor: DocumentCursor<R>,
        registry: &InstrumentRegistry,
        source: impl Into<String>,
    ) -> Result<Self, ImportError> {
        let source = source.into();
        let enumerations = extract_enumerations(&mut cursor)?;
        let section = extract_instrument(&mut cursor)?;
        let identity = registry.require(&section.name)?.clone();
        info!(
            source = %source,
            instrument = %identity.instrument,
            serial = identity.serial,
            parameters = section.parameters.len(),
            "document metadata read"
        );
        Ok(Self {
            source,
            cursor,
            enumerations,
            parameters: section.parameters,
            identity,
        })
    }

    pub fn identity(&self) -> &InstrumentIdentity {
        &self.identity
    }

    pub fn enumerations(&self) -> &EnumerationTable {
        &self.enumerations
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Runs imports against one store gateway.
pub struct Importer<'r, G> {
    gateway: G,
    config: ImportConfig,
    registry: &'r InstrumentRegistry,
    resolver: MetadataResolver,
}

impl<'r, G: StoreGateway> Importer<'r, G> {
    pub fn new(gateway: G, config: ImportConfig, registry: &'r InstrumentRegistry) -> Self {
        let resolver = MetadataResolver::new(config.enum_strategy);
        Self {
            gateway,
            config,
            registry,
            resolver,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn into_gateway(self) -> G {
        self.gateway
    }

    /// Import one document file.
    pub fn import_file(&mut self, path: &Path) -> Result<ImportReport, ImportError> {
        let prepared = PreparedImport::open(path, self.registry)?;
        self.import_prepared(prepared)
    }

    /// Store the metadata and values of an already opened document inside
    /// one transaction.
    pub fn import_prepared<R: BufRead>(
        &mut self,
        prepared: PreparedImport<R>,
    ) -> Result<ImportReport, ImportError> {
        let started = Instant::now();
        let source = prepared.source.clone();
        self.gateway.begin().map_err(ImportError::Store)?;

        match self.run(prepared, started) {
            Ok(report) => {
                self.gateway.commit().map_err(ImportError::Store)?;
                info!(
                    source = %report.source,
                    instrument = %report.instrument.name,
                    rows = report.rows_yielded,
                    dropped = report.rows_dropped,
                    blocks_skipped = report.blocks_skipped,
                    stored_rows = report.stored_rows(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "import committed"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback) = self.gateway.rollback() {
                    error!(source = %source, error = %rollback, "rollback failed");
                }
                error!(source = %source, code = e.code(), category = %e.category(), error = %e, "import rolled back");
                Err(e)
            }
        }
    }

    fn run<R: BufRead>(
        &mut self,
        prepared: PreparedImport<R>,
        started: Instant,
    ) -> Result<ImportReport, ImportError> {
        let PreparedImport {
            source,
            cursor,
            enumerations,
            parameters,
            identity,
        } = prepared;

        let resolved = self
            .resolver
            .resolve(&mut self.gateway, &identity, &enumerations, &parameters)
            .map_err(ImportError::Metadata)?;
        let instrument_id = resolved.instrument.id;

        let loader = BulkLoader::from_config(&self.config)
            .with_count_scope(CountScope::instrument_data(instrument_id));
        let mut stream = ValueStream::new(cursor, &parameters, instrument_id, self.config.row_errors);
        let load = loader
            .try_load(&mut self.gateway, stream.by_ref())
            .map_err(ImportError::from_load)?;
        let StreamStats {
            rows_yielded,
            rows_dropped,
            blocks_skipped,
            ..
        } = stream.stats();

        if rows_dropped > 0 || blocks_skipped > 0 {
            warn!(
                source = %source,
                rows_dropped,
                blocks_skipped,
                "some datapoints were not imported"
            );
        }

        Ok(ImportReport {
            source,
            instrument: resolved.instrument,
            serial: identity.serial,
            enumerations: resolved.enumerations,
            parameters: resolved.parameters,
            parameters_inserted: resolved.parameters_inserted,
            rows_yielded,
            rows_dropped,
            blocks_skipped,
            load,
            elapsed: started.elapsed(),
        })
    }
}

/// Command-line document paths in order, without exact repeats.
pub fn dedup_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths
        .iter()
        .filter(|p| seen.insert(p.as_path()))
        .cloned()
        .collect()
}
