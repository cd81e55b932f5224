//! Row decoding into JSON values.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! `fetch_as_string` coercion is applied last, on the decoded value, so it
//! behaves the same for every backend.

use crate::models::{ColumnMetadata, DatabaseType, FetchType, ResolvedOptions};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    Unknown,
}

impl TypeCategory {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float | Self::Decimal)
    }
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("timestamp")
        || lower.contains("datetime")
        || lower == "date"
        || lower == "time"
    {
        return TypeCategory::Temporal;
    }

    // Integer types ("point" and "interval" contain "int" but are not integers)
    if (lower.contains("int") && !lower.contains("point") && lower != "interval")
        || lower.contains("serial")
        || lower.contains("tiny")
    {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Value Helpers
// =============================================================================

/// Decode binary data to JSON value.
///
/// If `as_text` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `as_text` is false.
pub fn decode_binary_value(bytes: &[u8], as_text: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if as_text {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return JsonValue::String(s.to_string());
        }
    }
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Apply `fetch_as_string` to a decoded value.
pub fn coerce_value(value: JsonValue, category: TypeCategory, options: &ResolvedOptions) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::Null,
        JsonValue::Number(n) if category.is_numeric() && options.coerces(FetchType::Number) => {
            JsonValue::String(n.to_string())
        }
        other if category == TypeCategory::Json && options.coerces(FetchType::Json) => {
            JsonValue::String(other.to_string())
        }
        other => other,
    }
}

fn describe_columns<R: Row>(row: &R) -> Vec<ColumnMetadata> {
    row.columns()
        .iter()
        .map(|col| {
            ColumnMetadata::new(
                col.name(),
                col.type_info().name(),
                !col.type_info().is_null(),
            )
        })
        .collect()
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to positional JSON values.
pub trait RowToJson {
    fn column_metadata(&self) -> Vec<ColumnMetadata>;
    fn to_json_values(&self, options: &ResolvedOptions) -> Vec<JsonValue>;
}

impl RowToJson for MySqlRow {
    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        describe_columns(self)
    }

    fn to_json_values(&self, options: &ResolvedOptions) -> Vec<JsonValue> {
        let buffer_as_text = options.coerces(FetchType::Buffer);
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                let value = mysql::decode_column(self, idx, type_name, category, buffer_as_text);
                coerce_value(value, category, options)
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        describe_columns(self)
    }

    fn to_json_values(&self, options: &ResolvedOptions) -> Vec<JsonValue> {
        let buffer_as_text = options.coerces(FetchType::Buffer);
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                let value = postgres::decode_column(self, idx, type_name, category, buffer_as_text);
                coerce_value(value, category, options)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        describe_columns(self)
    }

    fn to_json_values(&self, options: &ResolvedOptions) -> Vec<JsonValue> {
        let buffer_as_text = options.coerces(FetchType::Buffer);
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let declared = categorize_type(col.type_info().name(), DatabaseType::SQLite);
                let (value, category) = sqlite::decode_column(self, idx, declared, buffer_as_text);
                coerce_value(value, category, options)
            })
            .collect()
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
        buffer_as_text: bool,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx, buffer_as_text),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode DECIMAL: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        // Signed first, then unsigned; MySQL reports exact widths
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        row.try_get::<Option<u8>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary_col(row: &MySqlRow, idx: usize, buffer_as_text: bool) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v, buffer_as_text))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_temporal(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        let value = match type_name.to_ascii_uppercase().as_str() {
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            "TIME" => row
                .try_get::<Option<NaiveTime>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            "TIMESTAMP" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_rfc3339()),
            _ => row
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_string()),
        };
        // TIME values outside 00:00..24:00 do not fit NaiveTime
        value
            .map(JsonValue::String)
            .unwrap_or_else(|| decode_text(row, idx))
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null)
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
        buffer_as_text: bool,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx, buffer_as_text),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode NUMERIC: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        row.try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary_col(row: &PgRow, idx: usize, buffer_as_text: bool) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v, buffer_as_text))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_temporal(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        let value = match type_name.to_ascii_uppercase().as_str() {
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_rfc3339()),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            "TIME" => row
                .try_get::<Option<NaiveTime>, _>(idx)
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            _ => None,
        };
        value
            .map(JsonValue::String)
            .unwrap_or_else(|| decode_text(row, idx))
    }

    fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null)
    }
}

mod sqlite {
    use super::*;
    use sqlx::ValueRef;

    /// SQLite is dynamically typed, so decoding follows the stored value.
    /// The declared type only decides booleans and JSON documents.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        declared: TypeCategory,
        buffer_as_text: bool,
    ) -> (JsonValue, TypeCategory) {
        let Ok(raw) = row.try_get_raw(idx) else {
            return (JsonValue::Null, declared);
        };
        if raw.is_null() {
            return (JsonValue::Null, declared);
        }
        let storage = raw.type_info().name().to_ascii_uppercase();

        match storage.as_str() {
            "INTEGER" | "INT8" | "BOOLEAN" => {
                let Ok(v) = row.try_get_unchecked::<i64, _>(idx) else {
                    return (JsonValue::Null, declared);
                };
                if declared == TypeCategory::Boolean {
                    (JsonValue::Bool(v != 0), TypeCategory::Boolean)
                } else {
                    (JsonValue::Number(v.into()), TypeCategory::Integer)
                }
            }
            "REAL" => {
                let value = row
                    .try_get_unchecked::<f64, _>(idx)
                    .map(float_value)
                    .unwrap_or(JsonValue::Null);
                (value, TypeCategory::Float)
            }
            "BLOB" => {
                let value = row
                    .try_get_unchecked::<Vec<u8>, _>(idx)
                    .map(|v| decode_binary_value(&v, buffer_as_text))
                    .unwrap_or(JsonValue::Null);
                (value, TypeCategory::Binary)
            }
            _ => {
                let Ok(text) = row.try_get_unchecked::<String, _>(idx) else {
                    return (JsonValue::Null, declared);
                };
                if declared == TypeCategory::Json {
                    if let Ok(json) = serde_json::from_str::<JsonValue>(&text) {
                        return (json, TypeCategory::Json);
                    }
                }
                (JsonValue::String(text), TypeCategory::Text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutFormat;
    use serde_json::json;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("POINT", DatabaseType::PostgreSQL),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DatabaseType::MySQL),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::Temporal
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::MySQL),
            TypeCategory::Temporal
        );
        assert_eq!(
            categorize_type("DATE", DatabaseType::MySQL),
            TypeCategory::Temporal
        );
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(decode_binary_value(b"hello world", true), json!("hello world"));
        assert_eq!(
            decode_binary_value(b"hello world", false),
            json!("aGVsbG8gd29ybGQ=")
        );
        // Invalid UTF-8 falls back to base64
        assert_eq!(
            decode_binary_value(&[0xFF, 0xFE, 0x00, 0x01], true),
            json!("//4AAQ==")
        );
    }

    #[test]
    fn test_coerce_numbers_only_when_requested() {
        let plain = ResolvedOptions::default();
        let numbers = ResolvedOptions::new(OutFormat::Object, [FetchType::Number].into());

        assert_eq!(coerce_value(json!(42), TypeCategory::Integer, &plain), json!(42));
        assert_eq!(coerce_value(json!(42), TypeCategory::Integer, &numbers), json!("42"));
        assert_eq!(coerce_value(json!(1.5), TypeCategory::Float, &numbers), json!("1.5"));
        assert_eq!(coerce_value(JsonValue::Null, TypeCategory::Integer, &numbers), JsonValue::Null);
        // Booleans are not numbers even when stored as integers
        assert_eq!(coerce_value(json!(true), TypeCategory::Boolean, &numbers), json!(true));
    }

    #[test]
    fn test_coerce_json_documents() {
        let options = ResolvedOptions::new(OutFormat::Object, [FetchType::Json].into());
        assert_eq!(
            coerce_value(json!({"a": 1}), TypeCategory::Json, &options),
            json!(r#"{"a":1}"#)
        );
        assert_eq!(
            coerce_value(json!({"a": 1}), TypeCategory::Json, &ResolvedOptions::default()),
            json!({"a": 1})
        );
    }
}
