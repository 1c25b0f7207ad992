//! Wire row codec for the bulk-copy channel.
//!
//! One row per line, five tab-separated columns in fixed order
//! `(time, instrument_id, param_id, value_num, value_text)`, `\n`-terminated,
//! NULL written as `\N`. Backslash, tab, newline and carriage return inside
//! a field are escaped so a value can never split a column or a row.

use chrono::{DateTime, Utc};

use hm_common::{render_timestamp, DataRow, EncodedValue, InstrumentId, ParamId};

use crate::error::StoreError;

/// NULL marker in the text copy format.
pub const NULL_SENTINEL: &str = "\\N";

/// Target columns, in wire order.
pub const COLUMNS: [&str; 5] = ["time", "instrument_id", "param_id", "value_num", "value_text"];

/// Layout used to read the time column back.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%z";

/// Append one encoded row, including its line terminator.
pub fn encode_row(row: &DataRow, out: &mut Vec<u8>) {
    out.extend_from_slice(render_timestamp(&row.time).as_bytes());
    out.push(b'\t');
    out.extend_from_slice(row.instrument_id.to_string().as_bytes());
    out.push(b'\t');
    out.extend_from_slice(row.param_id.to_string().as_bytes());
    out.push(b'\t');
    push_field(out, row.value.numeric());
    out.push(b'\t');
    push_field(out, row.value.text());
    out.push(b'\n');
}

/// Encode a single row as a line (with terminator).
pub fn encode_line(row: &DataRow) -> String {
    let mut out = Vec::with_capacity(64);
    encode_row(row, &mut out);
    // Fields are &str and escapes are ASCII, so this is always valid UTF-8.
    String::from_utf8_lossy(&out).into_owned()
}

fn push_field(out: &mut Vec<u8>, field: Option<&str>) {
    let Some(text) = field else {
        out.extend_from_slice(NULL_SENTINEL.as_bytes());
        return;
    };
    for b in text.bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            _ => out.push(b),
        }
    }
}

/// Parse one wire line (terminator optional) back into a row.
pub fn decode_line(line: &str) -> Result<DataRow, StoreError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != COLUMNS.len() {
        return Err(StoreError::CopyFormat(format!(
            "expected {} columns, found {}",
            COLUMNS.len(),
            fields.len()
        )));
    }

    let time = DateTime::parse_from_str(fields[0], TIME_FORMAT)
        .map_err(|e| StoreError::CopyFormat(format!("bad time '{}': {e}", fields[0])))?
        .with_timezone(&Utc);
    let instrument_id = fields[1]
        .parse::<i32>()
        .map(InstrumentId)
        .map_err(|_| StoreError::CopyFormat(format!("bad instrument_id '{}'", fields[1])))?;
    let param_id = fields[2]
        .parse::<i32>()
        .map(ParamId)
        .map_err(|_| StoreError::CopyFormat(format!("bad param_id '{}'", fields[2])))?;

    let value = match (unescape(fields[3])?, unescape(fields[4])?) {
        (Some(n), None) => EncodedValue::Numeric(n),
        (None, Some(t)) => EncodedValue::Text(t),
        _ => {
            return Err(StoreError::CopyFormat(
                "exactly one of value_num and value_text must be set".to_string(),
            ))
        }
    };

    Ok(DataRow {
        time,
        instrument_id,
        param_id,
        value,
    })
}

fn unescape(field: &str) -> Result<Option<String>, StoreError> {
    if field == NULL_SENTINEL {
        return Ok(None);
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(StoreError::CopyFormat(format!(
                    "unsupported escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(value: EncodedValue) -> DataRow {
        DataRow {
            time: Utc.with_ymd_and_hms(2025, 6, 30, 13, 6, 5).unwrap()
                + chrono::Duration::milliseconds(123),
            instrument_id: InstrumentId(1),
            param_id: ParamId(184),
            value,
        }
    }

    #[test]
    fn test_numeric_row_layout() {
        let line = encode_line(&row(EncodedValue::Numeric("42".into())));
        assert_eq!(line, "2025-06-30 13:06:05.123+0000\t1\t184\t42\t\\N\n");
    }

    #[test]
    fn test_text_row_layout() {
        let line = encode_line(&row(EncodedValue::Text("Operate".into())));
        assert_eq!(line, "2025-06-30 13:06:05.123+0000\t1\t184\t\\N\tOperate\n");
    }

    #[test]
    fn test_special_characters_escaped() {
        let line = encode_line(&row(EncodedValue::Text("a\tb\nc\\d\re".into())));
        assert_eq!(line.matches('\t').count(), 4);
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with("\\N\ta\\tb\\nc\\\\d\\re\n"));
    }

    #[test]
    fn test_literal_backslash_n_is_not_null() {
        let original = row(EncodedValue::Text("\\N".into()));
        let decoded = decode_line(&encode_line(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_text_is_not_null() {
        let original = row(EncodedValue::Text(String::new()));
        let line = encode_line(&original);
        assert!(line.ends_with("\\N\t\n"));
        assert_eq!(decode_line(&line).unwrap(), original);
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        assert!(matches!(
            decode_line("2025-06-30 13:06:05.123+0000\t1\t184\n"),
            Err(StoreError::CopyFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_both_slots_null() {
        assert!(decode_line("2025-06-30 13:06:05.123+0000\t1\t184\t\\N\t\\N").is_err());
    }
}
