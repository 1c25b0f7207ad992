//! Health monitor export import.
//!
//! This crate provides:
//! - A pull cursor over plain or gzip-compressed export documents
//! - The metadata extractor (enumerations, instrument, parameters)
//! - The lazy value stream producing normalized datapoint rows
//! - The metadata resolver that upserts instrument/enumeration/parameter rows
//! - The import pipeline, its error taxonomy and exit codes
//! - The directory watcher that picks up completed exports
//! - Logging setup and the `hm-import` command surface

pub mod cli;
pub mod document;
pub mod exit_codes;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod resolve;
pub mod stream;
pub mod watch;

pub use document::{open_document, DocumentCursor, DocumentError, Element, Node};
pub use exit_codes::ExitCode;
pub use logging::LogFormat;
pub use extract::{extract_enumerations, extract_instrument, InstrumentSection};
pub use pipeline::{ImportError, ImportReport, Importer, PreparedImport};
pub use resolve::{EnumRefs, MetadataResolver, ResolvedMetadata};
pub use stream::{StreamError, StreamStats, ValueStream};
pub use watch::{DirectoryWatcher, WatchConfig, WatchError};
