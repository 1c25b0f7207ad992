//! Health monitor import: shared types, encodings, and errors.
//!
//! This crate provides foundational types shared across the hm-* crates:
//! - Instrument, parameter, and enumeration records extracted from exports
//! - Timestamp normalization into the store's fixed-width UTC form
//! - Typed value encoding into numeric/text slots
//! - Row-level error types and the import error taxonomy

pub mod error;
pub mod id;
pub mod model;
pub mod timestamp;
pub mod value;

pub use error::{ErrorCategory, MalformedTimestamp, RowError, ValueConversionError};
pub use id::{EnumRef, InstrumentId, ParamId};
pub use model::{
    DataRow, DatabaseKind, EnumMember, Enumeration, EnumerationTable, InstrumentIdentity,
    InstrumentRef, ParameterRecord, ParameterTable,
};
pub use timestamp::{normalize, parse_timestamp, render_timestamp};
pub use value::{EncodedValue, ValueType};
