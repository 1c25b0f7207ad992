//! Instrument, parameter, and enumeration identifiers.
//!
//! `InstrumentId` and `EnumRef` are assigned by the store; `ParamId` is
//! assigned by the exporting instrument and is only unique per instrument.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned instrument identifier (foreign key for everything downstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub i32);

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for InstrumentId {
    fn from(id: i32) -> Self {
        InstrumentId(id)
    }
}

/// Numeric parameter identifier from the export's `ID` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamId(pub i32);

impl ParamId {
    /// Parse a parameter id attribute, tolerating surrounding whitespace.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<i32>().ok().map(ParamId)
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ParamId {
    fn from(id: i32) -> Self {
        ParamId(id)
    }
}

/// Identifier a parameter uses to reference its enumeration.
///
/// Under the natural-key strategy this is the `enum_types` row id; under the
/// sequential strategy it is the per-instrument enumeration number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnumRef(pub i32);

impl fmt::Display for EnumRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
