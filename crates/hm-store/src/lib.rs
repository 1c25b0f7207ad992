//! Health monitor store access.
//!
//! This crate provides:
//! - The `StoreGateway` trait every store backend implements
//! - The tab-separated wire row codec used by the bulk-copy channel
//! - `BulkLoader`, which streams or batch-inserts datapoint rows
//! - An in-memory gateway for tests and dry runs
//! - A PostgreSQL gateway (feature `postgres`)

pub mod error;
pub mod gateway;
pub mod loader;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod wire;

pub use error::{LoadError, StoreError};
pub use gateway::{
    CopyWriter, CountScope, EnumSequence, EnumValueRow, ParameterRow, PurgeReport,
    SequentialEnumRow, StoreGateway,
};
pub use loader::{BulkLoader, LoadReport};
pub use memory::{FailPoint, MemoryStore, StoredParameter};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use wire::{decode_line, encode_row, NULL_SENTINEL};
