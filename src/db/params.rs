//! Parameter binding for the sqlx backend.

use crate::models::QueryParam;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Database, Encode, Type};

/// Bind one positional parameter, for any of the supported drivers.
///
/// JSON arrays and objects are bound as JSON documents (TEXT on SQLite).
pub(crate) fn bind_param<'q, DB>(
    query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    param: &'q QueryParam,
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    &'q str: Encode<'q, DB> + Type<DB>,
    Json<&'q JsonValue>: Encode<'q, DB> + Type<DB>,
{
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}
