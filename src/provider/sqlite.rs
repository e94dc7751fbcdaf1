// ABOUTME: SQLite Connection Provider backed by rusqlite
// ABOUTME: Converts SQLite values to JSON (BLOBs as base64 objects) and back

use super::{ColumnMetadata, Connection, Dialect, TableName};
use crate::error::{SyncError, SyncResult};
use crate::value::Row;
use async_trait::async_trait;
use rusqlite::types::Value as SqliteValue;
use rusqlite::{ErrorCode, OpenFlags};
use serde_json::Value as JsonValue;
use std::sync::{Mutex, MutexGuard};

const DEFAULT_SCHEMA: &str = "main";

/// SQLite connection. rusqlite connections are `Send` but not `Sync`, so the
/// handle sits behind a mutex; every call is synchronous and never holds the
/// lock across an await point.
pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
    path: String,
}

impl SqliteConnection {
    /// Open an existing database file, or `:memory:`.
    ///
    /// A missing file is an error instead of silently creating an empty
    /// database, since an empty source or target would look like "delete
    /// everything" to the change detector.
    pub fn open(path: &str) -> SyncResult<Self> {
        let conn = if path == ":memory:" {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| SyncError::Connectivity(format!("Failed to open SQLite database '{}': {}", path, e)))?;

        tracing::debug!("Opened SQLite database '{}'", path);

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_string(),
        })
    }

    /// Run one or more statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> SyncResult<()> {
        self.lock()?.execute_batch(sql).map_err(classify)
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Connectivity(format!("SQLite handle for '{}' is poisoned", self.path)))
    }

    fn schema_of(table: &TableName) -> &str {
        table.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    fn table_info(&self, table: &TableName) -> SyncResult<Vec<(ColumnMetadata, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
            )
            .map_err(classify)?;

        let columns = stmt
            .query_map([table.name.as_str(), Self::schema_of(table)], |row| {
                let name: String = row.get(0)?;
                let data_type: String = row.get(1)?;
                let not_null: i64 = row.get(2)?;
                let pk: i64 = row.get(3)?;
                Ok((name, data_type, not_null, pk))
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        let pk_count = columns.iter().filter(|c| c.3 > 0).count();

        Ok(columns
            .into_iter()
            .map(|(name, data_type, not_null, pk)| {
                let (max_length, precision, scale) = parse_type_modifiers(&data_type);
                // A single INTEGER PRIMARY KEY aliases rowid and is auto-assigned
                let is_identity =
                    pk > 0 && pk_count == 1 && data_type.eq_ignore_ascii_case("INTEGER");
                let column = ColumnMetadata {
                    name,
                    data_type,
                    nullable: not_null == 0 && pk == 0,
                    is_primary_key: pk > 0,
                    is_identity,
                    max_length,
                    precision,
                    scale,
                };
                (column, pk)
            })
            .collect())
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }

    async fn query(&self, sql: &str, params: &[JsonValue]) -> SyncResult<Vec<Row>> {
        let bound = params
            .iter()
            .map(json_to_sqlite)
            .collect::<SyncResult<Vec<_>>>()?;

        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(bound.iter()))
            .map_err(classify)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut map = Row::new();
            for (idx, name) in names.iter().enumerate() {
                let value: SqliteValue = row.get(idx).map_err(classify)?;
                map.insert(name.clone(), sqlite_value_to_json(&value));
            }
            out.push(map);
        }

        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[JsonValue]) -> SyncResult<u64> {
        let bound = params
            .iter()
            .map(json_to_sqlite)
            .collect::<SyncResult<Vec<_>>>()?;

        let affected = self
            .lock()?
            .execute(sql, rusqlite::params_from_iter(bound.iter()))
            .map_err(classify)?;

        Ok(affected as u64)
    }

    async fn begin(&self) -> SyncResult<()> {
        self.execute_batch("BEGIN")
    }

    async fn commit(&self) -> SyncResult<()> {
        self.execute_batch("COMMIT")
    }

    async fn rollback(&self) -> SyncResult<()> {
        self.execute_batch("ROLLBACK")
    }

    async fn table_exists(&self, table: &TableName) -> SyncResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            crate::utils::quote_ident(Self::schema_of(table))
        );
        let count: i64 = self
            .lock()?
            .query_row(&sql, [table.name.as_str()], |row| row.get(0))
            .map_err(classify)?;
        Ok(count > 0)
    }

    async fn columns_of(&self, table: &TableName) -> SyncResult<Vec<ColumnMetadata>> {
        Ok(self.table_info(table)?.into_iter().map(|(c, _)| c).collect())
    }

    async fn primary_key_of(&self, table: &TableName) -> SyncResult<Vec<String>> {
        let mut pk: Vec<(ColumnMetadata, i64)> = self
            .table_info(table)?
            .into_iter()
            .filter(|(_, position)| *position > 0)
            .collect();
        pk.sort_by_key(|(_, position)| *position);
        Ok(pk.into_iter().map(|(c, _)| c.name).collect())
    }
}

/// Convert a single SQLite value to JSON.
///
/// - INTEGER → number
/// - REAL → number (non-finite values become strings)
/// - TEXT → string
/// - BLOB → `{"_type": "blob", "data": "<base64>"}`
/// - NULL → null
pub fn sqlite_value_to_json(value: &SqliteValue) -> JsonValue {
    match value {
        SqliteValue::Null => JsonValue::Null,
        SqliteValue::Integer(i) => JsonValue::Number((*i).into()),
        SqliteValue::Real(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        SqliteValue::Text(s) => JsonValue::String(s.clone()),
        SqliteValue::Blob(b) => {
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b);
            serde_json::json!({
                "_type": "blob",
                "data": encoded
            })
        }
    }
}

/// Convert a JSON parameter back into a SQLite value.
pub fn json_to_sqlite(value: &JsonValue) -> SyncResult<SqliteValue> {
    Ok(match value {
        JsonValue::Null => SqliteValue::Null,
        JsonValue::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqliteValue::Integer(i),
            None => SqliteValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => SqliteValue::Text(s.clone()),
        JsonValue::Object(map) if map.get("_type").and_then(JsonValue::as_str) == Some("blob") => {
            let data = map.get("data").and_then(JsonValue::as_str).unwrap_or_default();
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
                .map_err(|e| SyncError::Statement(format!("Invalid base64 BLOB value: {}", e)))?;
            SqliteValue::Blob(bytes)
        }
        other => SqliteValue::Text(other.to_string()),
    })
}

fn classify(err: rusqlite::Error) -> SyncError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if matches!(
            failure.code,
            ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
        ) {
            return SyncError::Connectivity(err.to_string());
        }
    }
    SyncError::Statement(err.to_string())
}

/// Split `VARCHAR(50)` / `DECIMAL(10,2)` style modifiers into
/// (max_length, precision, scale).
fn parse_type_modifiers(data_type: &str) -> (Option<i32>, Option<i32>, Option<i32>) {
    let Some(open) = data_type.find('(') else {
        return (None, None, None);
    };
    let Some(close) = data_type.rfind(')') else {
        return (None, None, None);
    };
    if close <= open {
        return (None, None, None);
    }

    let args: Vec<i32> = data_type[open + 1..close]
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    let base = data_type[..open].trim().to_ascii_uppercase();
    let numeric = ["DECIMAL", "NUMERIC", "NUMBER", "REAL", "FLOAT", "DOUBLE"]
        .iter()
        .any(|n| base.starts_with(n));

    if numeric {
        (None, args.first().copied(), args.get(1).copied())
    } else {
        (args.first().copied(), None, None)
    }
}
