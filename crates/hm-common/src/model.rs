//! Records extracted from a health monitor export.
//!
//! The export carries three ordered sections: enumeration definitions,
//! instrument/parameter metadata, and value blocks. These types hold what the
//! first two sections produce plus the datapoint rows built from the third.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{InstrumentId, ParamId};
use crate::value::{EncodedValue, ValueType};

// ── Instruments ─────────────────────────────────────────────────────────

/// Database an instrument's data is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// Transmission electron microscopes.
    Tem,
    /// Scanning electron microscopes.
    Sem,
}

impl DatabaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseKind::Tem => "tem",
            DatabaseKind::Sem => "sem",
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of one physical instrument, as listed in the settings file.
///
/// `instrument` is the natural key and must equal the export's
/// `<Instrument Name="...">` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentIdentity {
    /// Natural key, e.g. `"9999, Test Instrument"`.
    pub instrument: String,
    pub serial: i64,
    pub model: String,
    /// Human-readable display name.
    pub name: String,
    #[serde(rename = "type")]
    pub database: DatabaseKind,
    pub template: String,
    pub server: String,
}

/// Stable store identifier plus display name, returned by the upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub id: InstrumentId,
    pub name: String,
}

// ── Enumerations ────────────────────────────────────────────────────────

/// One symbolic member of an enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    pub value: i32,
}

/// A named integer domain, e.g. `FegState_enum`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enumeration {
    pub name: String,
    pub members: Vec<EnumMember>,
}

impl Enumeration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Add a member. Member values are write-once: a repeated name keeps the
    /// first value and returns false.
    pub fn add_member(&mut self, name: impl Into<String>, value: i32) -> bool {
        let name = name.into();
        if self.members.iter().any(|m| m.name == name) {
            return false;
        }
        self.members.push(EnumMember { name, value });
        true
    }

    pub fn value_of(&self, member: &str) -> Option<i32> {
        self.members
            .iter()
            .find(|m| m.name == member)
            .map(|m| m.value)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// All enumerations of a document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationTable {
    entries: Vec<Enumeration>,
}

impl EnumerationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an enumeration; a later definition with the same name replaces
    /// the earlier one in place.
    pub fn insert(&mut self, enumeration: Enumeration) {
        match self.entries.iter_mut().find(|e| e.name == enumeration.name) {
            Some(existing) => *existing = enumeration,
            None => self.entries.push(enumeration),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Enumeration> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Enumeration> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of members across all enumerations.
    pub fn member_count(&self) -> usize {
        self.entries.iter().map(Enumeration::len).sum()
    }
}

// ── Parameters ──────────────────────────────────────────────────────────

/// Metadata of one telemetry channel. Absent attributes are `None`, never "".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub param_id: ParamId,
    pub subsystem: Option<String>,
    pub component: Option<String>,
    pub name: String,
    pub display_name: Option<String>,
    pub display_unit: Option<String>,
    pub storage_unit: Option<String>,
    /// `Log` or `Linear`.
    pub display_scale: Option<String>,
    pub value_type: ValueType,
    /// Name of the backing enumeration, if any.
    pub enum_name: Option<String>,
}

/// Parameters keyed by their export id.
pub type ParameterTable = BTreeMap<ParamId, ParameterRecord>;

// ── Datapoints ──────────────────────────────────────────────────────────

/// One normalized observation, ready for the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRow {
    pub time: DateTime<Utc>,
    pub instrument_id: InstrumentId,
    pub param_id: ParamId,
    pub value: EncodedValue,
}

impl DataRow {
    /// Primary uniqueness key in the store.
    pub fn key(&self) -> (DateTime<Utc>, InstrumentId, ParamId) {
        (self.time, self.instrument_id, self.param_id)
    }
}
