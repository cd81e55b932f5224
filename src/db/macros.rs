//! Database dispatch macros for reducing code duplication.
//!
//! The sqlx backend keeps one variant per driver, both for pools and for
//! leased connections. These macros generate the per-driver match arms
//! while keeping each arm's body readable.

/// Macro for generating per-driver match arms over `DbPool` or `DbConnection`.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($kind:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$kind::$variant($p) => $body,
            )+
        }
    };
}

/// Run one statement on a leased sqlx connection.
///
/// Raw SQL is sent when there are no parameters so that multi-statement
/// scripts and statements that cannot be prepared still work. Rows past
/// `max_rows` are drained from the stream but not kept.
#[macro_export]
macro_rules! fetch_statement {
    ($conn:expr, $sql:expr, $params:expr, $bind:path, $max_rows:expr) => {{
        use futures_util::TryStreamExt;

        let mut stream = if $params.is_empty() {
            sqlx::Executor::fetch_many(&mut **$conn, $sql)
        } else {
            let mut query = sqlx::query($sql);
            for param in $params {
                query = $bind(query, param);
            }
            sqlx::Executor::fetch_many(&mut **$conn, query)
        };

        let mut rows = Vec::new();
        let mut rows_affected: u64 = 0;
        let mut truncated = false;
        while let Some(item) = stream
            .try_next()
            .await
            .map_err(|e| $crate::error::DbError::from_execute(e, $sql))?
        {
            match item {
                sqlx::Either::Left(done) => rows_affected += done.rows_affected(),
                sqlx::Either::Right(row) => {
                    if $max_rows.is_some_and(|max: u32| rows.len() >= max as usize) {
                        truncated = true;
                    } else {
                        rows.push(row);
                    }
                }
            }
        }
        (rows, rows_affected, truncated)
    }};
}

pub use fetch_statement;
pub use impl_db_dispatch;
