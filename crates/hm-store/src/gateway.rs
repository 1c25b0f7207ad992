//! Store gateway contract.
//!
//! Low-level primitives shared by every backend. The pipeline-level
//! operations (instrument/enumeration/parameter upsert, bulk load) are built
//! on top of these by the metadata resolver and [`crate::BulkLoader`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use hm_common::{DataRow, EnumRef, InstrumentId, InstrumentIdentity, InstrumentRef, ParameterRecord};

use crate::error::StoreError;

/// Enumeration numbers already assigned to one instrument (sequential strategy).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumSequence {
    /// Enumeration name → assigned number.
    pub assigned: HashMap<String, i32>,
    /// Highest number in use, 0 when none.
    pub max: i32,
}

impl EnumSequence {
    pub fn from_assigned(assigned: HashMap<String, i32>) -> Self {
        let max = assigned.values().copied().max().unwrap_or(0);
        Self { assigned, max }
    }
}

/// One member row of the legacy `enumerations` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialEnumRow {
    pub enum_id: i32,
    pub enum_name: String,
    pub member_name: String,
    pub value: i32,
}

/// One `enum_values` row referencing an `enum_types` id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValueRow {
    pub enum_id: i32,
    pub member_name: String,
    pub value: i32,
}

/// A parameter ready for insertion, with its resolved enumeration.
#[derive(Debug, Clone, Copy)]
pub struct ParameterRow<'a> {
    pub record: &'a ParameterRecord,
    pub enum_ref: Option<EnumRef>,
}

/// Which rows `count_rows` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    Instruments,
    EnumTypes(InstrumentId),
    EnumValues(InstrumentId),
    /// Distinct enumeration numbers in the legacy table.
    SequentialEnums(InstrumentId),
    /// Member rows in the legacy table.
    SequentialMembers(InstrumentId),
    Parameters(InstrumentId),
    /// Datapoints, optionally limited to one instrument and to `time > after`.
    Data {
        instrument_id: Option<InstrumentId>,
        after: Option<DateTime<Utc>>,
    },
}

impl CountScope {
    pub fn all_data() -> Self {
        CountScope::Data {
            instrument_id: None,
            after: None,
        }
    }

    pub fn instrument_data(instrument_id: InstrumentId) -> Self {
        CountScope::Data {
            instrument_id: Some(instrument_id),
            after: None,
        }
    }

    /// Table the scope counts in.
    pub fn table(&self) -> &'static str {
        match self {
            CountScope::Instruments => "instruments",
            CountScope::EnumTypes(_) => "enum_types",
            CountScope::EnumValues(_) => "enum_values",
            CountScope::SequentialEnums(_) | CountScope::SequentialMembers(_) => "enumerations",
            CountScope::Parameters(_) => "parameters",
            CountScope::Data { .. } => "data",
        }
    }
}

/// What `purge_instrument` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub serial: i64,
    pub instrument_id: Option<InstrumentId>,
    pub data_rows: u64,
    pub parameters: u64,
    pub enum_rows: u64,
    /// True when the instrument row itself was deleted.
    pub instrument_removed: bool,
}

/// Exclusive handle on the store's bulk-copy channel.
///
/// Holds the connection for its whole lifetime; nothing else may run on it
/// until `finish` or `abort` is called.
pub trait CopyWriter {
    /// Send one buffer of wire rows.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreError>;

    /// Complete the copy and return the number of rows the store accepted.
    fn finish(self: Box<Self>) -> Result<u64, StoreError>;

    /// Cancel the copy; nothing sent so far is kept.
    fn abort(self: Box<Self>, reason: &str) -> Result<(), StoreError>;
}

/// Primitives a store backend provides. Calls block until the store answers.
pub trait StoreGateway {
    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Insert-or-update by natural key; returns the stable id and display name.
    fn upsert_instrument(&mut self, identity: &InstrumentIdentity)
        -> Result<InstrumentRef, StoreError>;

    /// Enumeration numbers already in use for an instrument.
    fn enum_sequence(&mut self, instrument_id: InstrumentId) -> Result<EnumSequence, StoreError>;

    /// Conflict-ignore insert into the legacy enumeration table.
    fn insert_sequential_enums(
        &mut self,
        instrument_id: InstrumentId,
        rows: &[SequentialEnumRow],
    ) -> Result<u64, StoreError>;

    /// Conflict-ignore insert of enumeration types; returns the id of every
    /// requested name, new or existing.
    fn upsert_enum_types(
        &mut self,
        instrument_id: InstrumentId,
        names: &[&str],
    ) -> Result<HashMap<String, i32>, StoreError>;

    fn insert_enum_values(&mut self, rows: &[EnumValueRow]) -> Result<u64, StoreError>;

    /// Conflict-ignore on `(instrument_id, param_id)`.
    fn insert_parameters(
        &mut self,
        instrument_id: InstrumentId,
        rows: &[ParameterRow<'_>],
    ) -> Result<u64, StoreError>;

    /// Open the bulk-copy channel for the data table.
    fn copy_in(&mut self) -> Result<Box<dyn CopyWriter + '_>, StoreError>;

    /// Conflict-ignore insert of datapoints; returns rows actually inserted.
    fn insert_rows(&mut self, rows: &[DataRow]) -> Result<u64, StoreError>;

    fn count_rows(&mut self, scope: &CountScope) -> Result<u64, StoreError>;

    /// Without a cutoff, delete everything belonging to the instrument
    /// including its identity row. With one, delete only datapoints older
    /// than the cutoff.
    fn purge_instrument(
        &mut self,
        serial: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<PurgeReport, StoreError>;
}
