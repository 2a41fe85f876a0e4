//! Result Mapping
//!
//! Converts raw driver rows into normalized JSON records.
//!
//! # Normalization Rules
//! - SQL NULL is always JSON `null`, the key is never dropped
//! - Date and timestamp values become ISO-8601 strings with millisecond precision
//! - Binary values become Base64, truncated to `blob_max_bytes` before encoding
//! - Strings (CLOB or not) are truncated to `clob_max_chars` characters
//! - Truncated values end with [`TRUNCATION_MARKER`]

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::driver::NativeValue;

/// Suffix appended to every truncated value
pub const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

/// A normalized row: column name to JSON value
pub type NormalizedRow = serde_json::Map<String, serde_json::Value>;

static PAREN_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("static regex"));

/// Closed set of normalized column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    String,
    Number,
    Date,
    Binary,
    Boolean,
    Object,
}

/// Column metadata as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub native_type: String,
    pub inferred_type: TargetType,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
}

impl ColumnDescriptor {
    /// Describe a nullable column, inferring its target type from the native name
    pub fn new(name: impl Into<String>, native_type: impl Into<String>) -> Self {
        let native_type = native_type.into();
        Self {
            name: name.into(),
            inferred_type: map_type(&native_type),
            native_type,
            nullable: true,
            length: None,
            precision: None,
            scale: None,
        }
    }
}

/// Truncation thresholds applied while mapping values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperLimits {
    pub clob_max_chars: usize,
    pub blob_max_bytes: usize,
}

/// Map a native type name to the closed target type set
///
/// Parenthesized suffixes are ignored (`VARCHAR2(100 CHAR)` is `VARCHAR2`).
/// Unknown names map to [`TargetType::Object`].
#[must_use]
pub fn map_type(native_type: &str) -> TargetType {
    let upper = native_type.to_uppercase();
    let stripped = PAREN_SUFFIX.replace_all(&upper, "");
    let base = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if base.starts_with("TIMESTAMP") {
        return TargetType::Date;
    }

    match base.as_str() {
        "VARCHAR2" | "NVARCHAR2" | "VARCHAR" | "CHAR" | "NCHAR" | "CHARACTER" | "CHARACTER VARYING"
        | "TEXT" | "CLOB" | "NCLOB" | "LONG" | "ROWID" | "UROWID" | "BPCHAR" | "NAME" | "UUID"
        | "XMLTYPE" | "TIME" | "INTERVAL" => TargetType::String,
        "NUMBER" | "INTEGER" | "INT" | "SMALLINT" | "BIGINT" | "FLOAT" | "REAL" | "DECIMAL"
        | "NUMERIC" | "DOUBLE PRECISION" | "BINARY_FLOAT" | "BINARY_DOUBLE" | "INT2" | "INT4"
        | "INT8" | "FLOAT4" | "FLOAT8" | "OID" => TargetType::Number,
        "DATE" => TargetType::Date,
        "BLOB" | "RAW" | "LONG RAW" | "BFILE" | "BYTEA" => TargetType::Binary,
        "BOOLEAN" | "BOOL" => TargetType::Boolean,
        _ => TargetType::Object,
    }
}

/// Serialize a timestamp as ISO-8601 with millisecond precision
#[must_use]
pub fn to_iso(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 (RFC 3339) timestamp
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Map a single raw value
#[must_use]
pub fn map_value(value: NativeValue, native_type: &str, limits: &MapperLimits) -> serde_json::Value {
    use serde_json::Value;

    match value {
        NativeValue::Null => Value::Null,
        NativeValue::Bool(b) => Value::Bool(b),
        NativeValue::Int(i) => Value::Number(i.into()),
        // NaN/Infinity have no JSON representation
        NativeValue::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        NativeValue::Decimal(text) => map_decimal(text),
        NativeValue::Timestamp(ts) => Value::String(to_iso(&ts)),
        NativeValue::Text(text) => {
            if map_type(native_type) == TargetType::Date {
                if let Some(ts) = parse_iso(&text) {
                    return Value::String(to_iso(&ts));
                }
            }
            Value::String(truncate_text(text, limits.clob_max_chars))
        }
        NativeValue::Bytes(bytes) => Value::String(encode_binary(&bytes, limits.blob_max_bytes)),
        NativeValue::Json(json) => json,
    }
}

/// Exact decimals become JSON numbers only when the number prints back to
/// the same value; anything wider than an `f64` stays a string
fn map_decimal(text: String) -> serde_json::Value {
    use serde_json::Value;

    match text.parse::<serde_json::Number>() {
        Ok(number) if number.is_i64() || number.is_u64() => Value::Number(number),
        Ok(number) if trim_fraction(&number.to_string()) == trim_fraction(&text) => Value::Number(number),
        _ => Value::String(text),
    }
}

/// Drop trailing fractional zeros so `12.50` and `12.5` compare equal
fn trim_fraction(text: &str) -> &str {
    if text.contains('.') && !text.contains(['e', 'E']) {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Map one positional row against its column descriptors
///
/// Missing trailing values map to `null`; surplus values are ignored.
#[must_use]
pub fn map_row(columns: &[ColumnDescriptor], values: Vec<NativeValue>, limits: &MapperLimits) -> NormalizedRow {
    let mut values = values.into_iter();
    columns
        .iter()
        .map(|column| {
            let value = values.next().unwrap_or(NativeValue::Null);
            (column.name.clone(), map_value(value, &column.native_type, limits))
        })
        .collect()
}

/// Map every row of a result set
#[must_use]
pub fn map_rows(
    columns: &[ColumnDescriptor],
    rows: Vec<Vec<NativeValue>>,
    limits: &MapperLimits,
) -> Vec<NormalizedRow> {
    rows.into_iter().map(|row| map_row(columns, row, limits)).collect()
}

fn truncate_text(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text,
    }
}

fn encode_binary(bytes: &[u8], max_bytes: usize) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    if bytes.len() > max_bytes {
        format!("{}{TRUNCATION_MARKER}", engine.encode(&bytes[..max_bytes]))
    } else {
        engine.encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const LIMITS: MapperLimits = MapperLimits { clob_max_chars: 4000, blob_max_bytes: 8 };

    #[test]
    fn test_map_type_strips_suffixes() {
        assert_eq!(map_type("VARCHAR2(100 CHAR)"), TargetType::String);
        assert_eq!(map_type("NUMBER(10,2)"), TargetType::Number);
        assert_eq!(map_type("timestamp(6) with time zone"), TargetType::Date);
        assert_eq!(map_type("TIMESTAMP WITH LOCAL TIME ZONE"), TargetType::Date);
        assert_eq!(map_type("LONG RAW"), TargetType::Binary);
        assert_eq!(map_type("bool"), TargetType::Boolean);
    }

    #[test]
    fn test_map_type_unknown_is_object() {
        assert_eq!(map_type("SDO_GEOMETRY"), TargetType::Object);
        assert_eq!(map_type(""), TargetType::Object);
    }

    #[test]
    fn test_null_stays_null() {
        let columns = vec![ColumnDescriptor::new("ID", "NUMBER"), ColumnDescriptor::new("NAME", "VARCHAR2")];
        let row = map_row(&columns, vec![NativeValue::Int(1), NativeValue::Null], &LIMITS);
        assert_eq!(row.get("NAME"), Some(&serde_json::Value::Null));
    }

    #[test]
    fn test_short_row_pads_with_null() {
        let columns = vec![ColumnDescriptor::new("A", "NUMBER"), ColumnDescriptor::new("B", "NUMBER")];
        let row = map_row(&columns, vec![NativeValue::Int(1)], &LIMITS);
        assert_eq!(row.len(), 2);
        assert!(row["B"].is_null());
    }

    #[test]
    fn test_clob_truncation() {
        let text = "x".repeat(5000);
        let mapped = map_value(NativeValue::Text(text), "CLOB", &LIMITS);
        let mapped = mapped.as_str().unwrap();
        assert_eq!(mapped.len(), 4000 + TRUNCATION_MARKER.len());
        assert!(mapped.ends_with(TRUNCATION_MARKER));
        assert!(mapped.starts_with(&"x".repeat(4000)));
    }

    #[test]
    fn test_text_at_threshold_unchanged() {
        let text = "é".repeat(4000);
        let mapped = map_value(NativeValue::Text(text.clone()), "VARCHAR2", &LIMITS);
        assert_eq!(mapped, serde_json::Value::String(text));
    }

    #[test]
    fn test_blob_truncated_before_encoding() {
        let bytes = (0u8..16).collect::<Vec<_>>();
        let mapped = map_value(NativeValue::Bytes(bytes), "BLOB", &LIMITS);
        let expected = format!("{}{TRUNCATION_MARKER}", "AAECAwQFBgc=");
        assert_eq!(mapped, serde_json::Value::String(expected));

        let small = map_value(NativeValue::Bytes(vec![0, 1, 2]), "BLOB", &LIMITS);
        assert_eq!(small, serde_json::json!("AAEC"));
    }

    #[test]
    fn test_timestamp_iso_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        let mapped = map_value(NativeValue::Timestamp(ts), "DATE", &LIMITS);
        assert_eq!(mapped, serde_json::json!("2024-01-15T10:30:00.123Z"));
        assert_eq!(parse_iso(mapped.as_str().unwrap()), Some(ts));
    }

    #[test]
    fn test_decimal_and_float() {
        assert_eq!(map_value(NativeValue::Decimal("12.5".into()), "NUMBER", &LIMITS), serde_json::json!(12.5));
        assert_eq!(map_value(NativeValue::Decimal("NaN".into()), "NUMERIC", &LIMITS), serde_json::json!("NaN"));
        assert!(map_value(NativeValue::Float(f64::NAN), "BINARY_DOUBLE", &LIMITS).is_null());
    }

    #[test]
    fn test_decimal_keeps_precision() {
        let decimal = |text: &str| map_value(NativeValue::Decimal(text.into()), "NUMERIC", &LIMITS);

        assert_eq!(decimal("12345678901234567890123"), serde_json::json!("12345678901234567890123"));
        assert_eq!(decimal("0.1000000000000000000001"), serde_json::json!("0.1000000000000000000001"));
        assert_eq!(decimal("12345678901234567890"), serde_json::json!(12_345_678_901_234_567_890_u64));
        assert_eq!(decimal("-42"), serde_json::json!(-42));
        assert_eq!(decimal("123.45"), serde_json::json!(123.45));
        assert_eq!(decimal("12.50"), serde_json::json!(12.5));
    }

    #[test]
    fn test_nested_json_passthrough() {
        let json = serde_json::json!({"a": [1, 2]});
        assert_eq!(map_value(NativeValue::Json(json.clone()), "JSONB", &LIMITS), json);
    }
}
