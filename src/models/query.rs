//! Statement parameter and result models.

use crate::models::OutFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON documents
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

/// Returned rows, shaped by [`OutFormat`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rows {
    Objects(Vec<serde_json::Map<String, JsonValue>>),
    Arrays(Vec<Vec<JsonValue>>),
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Self::Objects(rows) => rows.len(),
            Self::Arrays(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Rows {
    fn default() -> Self {
        Self::Objects(Vec::new())
    }
}

/// Outcome of one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Rows,
    pub rows_affected: u64,
    /// True when `max_rows` cut the result short
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// Result of a statement that returned no rows.
    pub fn write_result(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Rows::default(),
            rows_affected,
            truncated: false,
            execution_time_ms,
        }
    }

    /// Shape positional row values into a result.
    ///
    /// Every row must have one value per column.
    pub fn from_values(
        columns: Vec<ColumnMetadata>,
        values: Vec<Vec<JsonValue>>,
        format: OutFormat,
    ) -> Self {
        let rows = match format {
            OutFormat::Array => Rows::Arrays(values),
            OutFormat::Object => Rows::Objects(
                values
                    .into_iter()
                    .map(|row| {
                        columns
                            .iter()
                            .zip(row)
                            .map(|(col, value)| (col.name.clone(), value))
                            .collect()
                    })
                    .collect(),
            ),
        };
        Self {
            columns,
            rows,
            rows_affected: 0,
            truncated: false,
            execution_time_ms: 0,
        }
    }

    pub fn with_rows_affected(mut self, rows_affected: u64) -> Self {
        self.rows_affected = rows_affected;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn with_execution_time_ms(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Value of `column` in the first row, for either row shape.
    pub fn first_value(&self, column: &str) -> Option<&JsonValue> {
        match &self.rows {
            Rows::Objects(rows) => rows.first()?.get(column),
            Rows::Arrays(rows) => {
                let idx = self.columns.iter().position(|c| c.name == column)?;
                rows.first()?.get(idx)
            }
        }
    }
}
