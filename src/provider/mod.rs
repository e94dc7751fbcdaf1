// ABOUTME: Connection Provider abstraction over the relational stores we sync
// ABOUTME: Query/execute/transaction/introspection capability plus SQL dialect rules

pub mod postgres;
pub mod sqlite;

use crate::error::{SyncError, SyncResult};
use crate::utils::quote_ident;
use crate::value::Row;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

pub use postgres::PostgresConnection;
pub use sqlite::SqliteConnection;

/// A possibly schema-qualified table name (`schema.table` or `table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Parse `schema.table` or `table`. Quoting is not interpreted.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let trimmed = raw.trim();
        let (schema, name) = match trimmed.split_once('.') {
            Some((schema, name)) => (Some(schema.trim().to_string()), name.trim().to_string()),
            None => (None, trimmed.to_string()),
        };
        if name.is_empty() || schema.as_deref() == Some("") || name.contains('.') {
            return Err(SyncError::validation(raw, "table name must be 'table' or 'schema.table'"));
        }
        Ok(Self { schema, name })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Column descriptor captured from the store's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_identity: bool,
    pub max_length: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            is_identity: false,
            max_length: None,
            precision: None,
            scale: None,
        }
    }
}

/// SQL spelling rules for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// Alias used for the pseudo column carrying a physical row identity.
pub const ROW_IDENTITY_ALIAS: &str = "__row_identity";

impl Dialect {
    pub fn quote_ident(&self, ident: &str) -> String {
        quote_ident(ident)
    }

    pub fn qualified(&self, table: &TableName) -> String {
        match &table.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
            None => quote_ident(&table.name),
        }
    }

    /// Placeholder for parameter `index` (1-based), bound against `column`.
    ///
    /// PostgreSQL parameters are always sent as text and cast to the column
    /// type on the server, so one binding path covers every column type.
    pub fn placeholder(&self, index: usize, column: Option<&ColumnMetadata>) -> String {
        match self {
            Dialect::Postgres => match column {
                // JSON arrays arrive as text; NULL must stay NULL rather than '{}'
                Some(col) if col.data_type.ends_with("[]") => format!(
                    "(CASE WHEN ${0}::text IS NULL THEN NULL ELSE ARRAY(SELECT jsonb_array_elements_text(${0}::text::jsonb))::{1} END)",
                    index, col.data_type
                ),
                Some(col) => format!("${}::text::{}", index, col.data_type),
                None => format!("${}::text", index),
            },
            Dialect::Sqlite => format!("?{}", index),
        }
    }

    /// Maximum bind parameters per statement, with margin.
    pub fn max_params(&self) -> usize {
        match self {
            Dialect::Postgres => 65000,
            Dialect::Sqlite => 32000,
        }
    }

    /// Clause inserted between the column list and `VALUES` when the insert
    /// carries explicit identity values that must win over generated ones.
    pub fn identity_override(&self, explicit_identity: bool) -> Option<&'static str> {
        match self {
            Dialect::Postgres if explicit_identity => Some("OVERRIDING SYSTEM VALUE"),
            _ => None,
        }
    }

    /// Physical row identity for tables without a primary key, with the type
    /// used to bind it back.
    pub fn row_identity(&self) -> ColumnMetadata {
        match self {
            Dialect::Postgres => ColumnMetadata::new("ctid", "tid"),
            Dialect::Sqlite => ColumnMetadata::new("rowid", "INTEGER"),
        }
    }
}

/// Query, execute, transaction and schema-introspection capability over one
/// database connection.
///
/// Rows come back as JSON maps in column order. Parameters are JSON values;
/// each implementation converts them to its driver's types. Driver errors are
/// classified into [`SyncError::Connectivity`] (run-fatal) and
/// [`SyncError::Statement`] (everything else).
#[async_trait]
pub trait Connection: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Human-readable description with credentials removed.
    fn describe(&self) -> String;

    async fn query(&self, sql: &str, params: &[JsonValue]) -> SyncResult<Vec<Row>>;

    async fn execute(&self, sql: &str, params: &[JsonValue]) -> SyncResult<u64>;

    async fn begin(&self) -> SyncResult<()>;

    async fn commit(&self) -> SyncResult<()>;

    async fn rollback(&self) -> SyncResult<()>;

    async fn table_exists(&self, table: &TableName) -> SyncResult<bool>;

    async fn columns_of(&self, table: &TableName) -> SyncResult<Vec<ColumnMetadata>>;

    async fn primary_key_of(&self, table: &TableName) -> SyncResult<Vec<String>>;

    /// Allow explicit values in identity columns for subsequent inserts.
    async fn set_identity_insert(&self, _table: &TableName, _enabled: bool) -> SyncResult<()> {
        Ok(())
    }

    /// Bring generators back in line after explicit identity values were written.
    async fn after_identity_insert(
        &self,
        _table: &TableName,
        _columns: &[ColumnMetadata],
    ) -> SyncResult<()> {
        Ok(())
    }
}

/// Open a connection, choosing the provider from the URL.
///
/// `postgres://` and `postgresql://` go to PostgreSQL; `sqlite:` URLs and
/// bare file paths go to SQLite.
pub async fn connect(url: &str, accept_invalid_certs: bool) -> SyncResult<Box<dyn Connection>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let conn = PostgresConnection::connect(url, accept_invalid_certs).await?;
        Ok(Box::new(conn))
    } else {
        let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")).unwrap_or(url);
        let conn = SqliteConnection::open(path)?;
        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_parse() {
        let t = TableName::parse("public.users").unwrap();
        assert_eq!(t.schema.as_deref(), Some("public"));
        assert_eq!(t.name, "users");
        assert_eq!(t.to_string(), "public.users");

        let t = TableName::parse("users").unwrap();
        assert!(t.schema.is_none());

        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("a.b.c").is_err());
        assert!(TableName::parse(".users").is_err());
    }

    #[test]
    fn test_qualified_quotes_both_parts() {
        let t = TableName::parse("Sales.Order Items").unwrap();
        assert_eq!(Dialect::Postgres.qualified(&t), "\"Sales\".\"Order Items\"");
    }

    #[test]
    fn test_postgres_placeholders_cast_through_text() {
        let col = ColumnMetadata::new("id", "integer");
        assert_eq!(Dialect::Postgres.placeholder(3, Some(&col)), "$3::text::integer");
        assert_eq!(Dialect::Postgres.placeholder(1, None), "$1::text");

        let arr = ColumnMetadata::new("tags", "text[]");
        let placeholder = Dialect::Postgres.placeholder(2, Some(&arr));
        assert!(placeholder.starts_with("(CASE WHEN $2::text IS NULL THEN NULL"));
        assert!(placeholder.contains("ARRAY(SELECT jsonb_array_elements_text($2::text::jsonb))::text[]"));
    }

    #[test]
    fn test_sqlite_placeholders_are_numbered() {
        let col = ColumnMetadata::new("id", "INTEGER");
        assert_eq!(Dialect::Sqlite.placeholder(4, Some(&col)), "?4");
    }

    #[test]
    fn test_identity_override_only_for_postgres() {
        assert_eq!(
            Dialect::Postgres.identity_override(true),
            Some("OVERRIDING SYSTEM VALUE")
        );
        assert_eq!(Dialect::Postgres.identity_override(false), None);
        assert_eq!(Dialect::Sqlite.identity_override(true), None);
    }
}
