//! Row shaping and per-statement execution options.

use crate::error::DbError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

/// Shape of returned rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutFormat {
    /// One JSON object per row, keyed by column name
    #[default]
    Object,
    /// One positional array per row, in column order
    Array,
}

impl OutFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

impl FromStr for OutFormat {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.strip_prefix("out_format_").unwrap_or(&lower) {
            "object" => Ok(Self::Object),
            "array" => Ok(Self::Array),
            _ => Err(DbError::configuration(format!(
                "Unrecognized out_format '{}': expected 'object' or 'array'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for OutFormat {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutFormat> for String {
    fn from(value: OutFormat) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for OutFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column kinds that can be coerced to text on fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FetchType {
    /// Integer, floating point and decimal columns
    Number,
    /// Binary columns: UTF-8 text instead of base64 (base64 when not valid UTF-8)
    Buffer,
    /// JSON columns: the serialized document instead of a parsed value
    Json,
}

impl FetchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Buffer => "buffer",
            Self::Json => "json",
        }
    }

    /// Parse a comma-separated list such as `number,json`.
    pub fn parse_list(s: &str) -> Result<BTreeSet<Self>, DbError> {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for FetchType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "number" => Ok(Self::Number),
            "buffer" => Ok(Self::Buffer),
            "json" => Ok(Self::Json),
            _ => Err(DbError::configuration(format!(
                "Unrecognized fetch_as_string type '{}': expected one of number, buffer, json",
                s
            ))),
        }
    }
}

impl TryFrom<String> for FetchType {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FetchType> for String {
    fn from(value: FetchType) -> Self {
        value.as_str().to_string()
    }
}

/// Per-call overrides. Unset fields fall back to the database defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default)]
    pub out_format: Option<OutFormat>,
    #[serde(default)]
    pub fetch_as_string: Option<BTreeSet<FetchType>>,
    /// Maximum rows returned; extra rows are consumed and `truncated` is set
    #[serde(default)]
    pub max_rows: Option<u32>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_out_format(mut self, format: OutFormat) -> Self {
        self.out_format = Some(format);
        self
    }

    pub fn with_fetch_as_string(mut self, types: impl IntoIterator<Item = FetchType>) -> Self {
        self.fetch_as_string = Some(types.into_iter().collect());
        self
    }

    pub fn with_max_rows(mut self, max_rows: u32) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options after merging call overrides over database defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub out_format: OutFormat,
    pub fetch_as_string: BTreeSet<FetchType>,
    pub max_rows: Option<u32>,
    pub timeout: Option<Duration>,
}

impl ResolvedOptions {
    pub fn new(out_format: OutFormat, fetch_as_string: BTreeSet<FetchType>) -> Self {
        Self {
            out_format,
            fetch_as_string,
            max_rows: None,
            timeout: None,
        }
    }

    /// Apply call overrides on top of these defaults.
    pub fn merge(&self, overrides: &ExecuteOptions) -> Self {
        Self {
            out_format: overrides.out_format.unwrap_or(self.out_format),
            fetch_as_string: overrides
                .fetch_as_string
                .clone()
                .unwrap_or_else(|| self.fetch_as_string.clone()),
            max_rows: overrides.max_rows.or(self.max_rows),
            timeout: overrides.timeout.or(self.timeout),
        }
    }

    pub fn coerces(&self, fetch_type: FetchType) -> bool {
        self.fetch_as_string.contains(&fetch_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_format_parsing() {
        assert_eq!("object".parse::<OutFormat>().unwrap(), OutFormat::Object);
        assert_eq!("ARRAY".parse::<OutFormat>().unwrap(), OutFormat::Array);
        assert_eq!(
            "OUT_FORMAT_OBJECT".parse::<OutFormat>().unwrap(),
            OutFormat::Object
        );
        let err = "table".parse::<OutFormat>().unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[test]
    fn test_fetch_type_list() {
        let types = FetchType::parse_list("NUMBER, json").unwrap();
        assert!(types.contains(&FetchType::Number));
        assert!(types.contains(&FetchType::Json));
        assert!(!types.contains(&FetchType::Buffer));

        assert!(FetchType::parse_list("number,clob").is_err());
        assert!(FetchType::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_options_serde_rejects_unknown_values() {
        let ok: ExecuteOptions =
            serde_json::from_str(r#"{"out_format":"array","fetch_as_string":["number"]}"#)
                .unwrap();
        assert_eq!(ok.out_format, Some(OutFormat::Array));

        let bad = serde_json::from_str::<ExecuteOptions>(r#"{"out_format":"rows"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let defaults = ResolvedOptions::new(OutFormat::Object, [FetchType::Number].into());
        let merged = defaults.merge(&ExecuteOptions::new().with_out_format(OutFormat::Array));
        assert_eq!(merged.out_format, OutFormat::Array);
        assert!(merged.coerces(FetchType::Number));

        let merged = defaults.merge(
            &ExecuteOptions::new()
                .with_fetch_as_string([])
                .with_max_rows(5),
        );
        assert!(!merged.coerces(FetchType::Number));
        assert_eq!(merged.max_rows, Some(5));
    }
}
