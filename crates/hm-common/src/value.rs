//! Typed value encoding.
//!
//! Every datapoint fills exactly one of two store columns: a numeric slot for
//! `int`/`float` parameters, a text slot for `str` parameters. The encoding
//! is chosen once per parameter by its [`ValueType`].

use serde::{Deserialize, Serialize};

use crate::error::ValueConversionError;
use crate::id::ParamId;

/// Declared type of a parameter. Enumerations are carried as `Int`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    #[serde(rename = "str")]
    String,
}

impl ValueType {
    /// Map the export's `Type` attribute (`Int`, `Float`, `String`).
    pub fn from_export(s: &str) -> Option<Self> {
        match s {
            "Int" => Some(ValueType::Int),
            "Float" => Some(ValueType::Float),
            "String" => Some(ValueType::String),
            _ => None,
        }
    }

    /// Representation stored in the `value_type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "str",
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueType::String)
    }

    /// Encode raw value text according to this type.
    ///
    /// `int` is rendered canonically; `float` keeps the source text as long
    /// as it parses; `str` keeps the raw text, with absent text as "".
    pub fn encode(
        self,
        param_id: ParamId,
        raw: Option<&str>,
    ) -> Result<EncodedValue, ValueConversionError> {
        let fail = || ValueConversionError {
            param_id,
            raw_value: raw.unwrap_or_default().to_string(),
            expected: self,
        };

        match self {
            ValueType::String => Ok(EncodedValue::Text(raw.unwrap_or_default().to_string())),
            ValueType::Int => {
                let text = raw.map(str::trim).ok_or_else(fail)?;
                let n = text.parse::<i64>().map_err(|_| fail())?;
                Ok(EncodedValue::Numeric(n.to_string()))
            }
            ValueType::Float => {
                let text = raw.map(str::trim).ok_or_else(fail)?;
                let f = text.parse::<f64>().map_err(|_| fail())?;
                if !float_in_range(text, f) {
                    return Err(fail());
                }
                Ok(EncodedValue::Numeric(text.to_string()))
            }
        }
    }
}

/// Whether `text` (which parsed to `f`) fits a double precision column.
///
/// Rust saturates out-of-range literals to infinity or zero; the store
/// rejects them. Explicit `inf`/`infinity`/`nan` spellings are accepted.
fn float_in_range(text: &str, f: f64) -> bool {
    if !f.is_finite() {
        let word = text.trim_start_matches(['+', '-']).to_ascii_lowercase();
        return matches!(word.as_str(), "inf" | "infinity" | "nan");
    }
    if f == 0.0 {
        let mantissa = text.split(['e', 'E']).next().unwrap_or_default();
        return !mantissa.bytes().any(|b| matches!(b, b'1'..=b'9'));
    }
    true
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value placed in exactly one of the two store slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
pub enum EncodedValue {
    Numeric(String),
    Text(String),
}

impl EncodedValue {
    /// Numeric slot content, `None` when the value lives in the text slot.
    pub fn numeric(&self) -> Option<&str> {
        match self {
            EncodedValue::Numeric(n) => Some(n),
            EncodedValue::Text(_) => None,
        }
    }

    /// Text slot content, `None` when the value lives in the numeric slot.
    pub fn text(&self) -> Option<&str> {
        match self {
            EncodedValue::Numeric(_) => None,
            EncodedValue::Text(t) => Some(t),
        }
    }
}
