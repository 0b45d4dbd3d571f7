//! SQLite backend via rusqlite.

use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};

use super::{Driver, DriverError, DriverSession, Rows, SqlValue};

/// How long a session waits on a locked database before reporting SQLITE_BUSY
const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Driver opening connections to one SQLite database file.
pub struct SqliteDriver {
    path: String,
}

impl SqliteDriver {
    /// `path` is a file path, or `:memory:` for a private in-memory database
    /// per connection.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Driver for SqliteDriver {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        let conn = if self.path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&self.path)
        }
        .map_err(map_error)?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_error)?;

        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: Connection,
}

impl DriverSession for SqliteSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Rows, DriverError> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;

        if stmt.column_count() == 0 {
            let affected = stmt
                .execute(rusqlite::params_from_iter(params.iter()))
                .map_err(map_error)?;
            return Ok(Rows::affected(affected as u64));
        }

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let width = columns.len();

        let mut result_rows = Vec::new();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(map_error)?;
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                let value: Value = row.get(idx).map_err(map_error)?;
                values.push(from_sqlite(value));
            }
            result_rows.push(values);
        }

        Ok(Rows {
            columns,
            rows: result_rows,
            affected: 0,
        })
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_sqlite(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(i),
        Value::Real(f) => SqlValue::Real(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Blob(b),
    }
}

fn map_error(e: rusqlite::Error) -> DriverError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => {
            let err = DriverError::new(e.to_string()).with_code(format!("{:?}", failure.code));
            // The handle is unusable after these; the pool replaces it.
            match failure.code {
                rusqlite::ErrorCode::SystemIoFailure
                | rusqlite::ErrorCode::DatabaseCorrupt
                | rusqlite::ErrorCode::NotADatabase
                | rusqlite::ErrorCode::CannotOpen => err.connection_lost(),
                _ => err,
            }
        }
        _ => DriverError::new(e.to_string()),
    }
}
