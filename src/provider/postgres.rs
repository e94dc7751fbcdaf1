// ABOUTME: PostgreSQL Connection Provider backed by tokio-postgres
// ABOUTME: Rows are fetched as row_to_json documents, parameters bound as text and cast server-side

use super::{ColumnMetadata, Connection, Dialect, TableName};
use crate::error::{SyncError, SyncResult};
use crate::utils::sanitize_url;
use crate::value::Row;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

const DEFAULT_SCHEMA: &str = "public";

/// PostgreSQL connection over a single tokio-postgres client.
pub struct PostgresConnection {
    client: Client,
    description: String,
}

impl PostgresConnection {
    /// Connect with TLS negotiated by native-tls.
    ///
    /// The connection task is spawned onto the tokio runtime; if it dies, the
    /// next statement fails with a closed-connection error, which is classified
    /// as run-fatal.
    pub async fn connect(url: &str, accept_invalid_certs: bool) -> SyncResult<Self> {
        let description = sanitize_url(url);

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| SyncError::Connectivity(format!("Failed to build TLS connector: {}", e)))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(tls);

        let (client, connection) = tokio_postgres::connect(url, tls)
            .await
            .map_err(|e| SyncError::Connectivity(format!("Failed to connect to {}: {}", description, e)))?;

        let label = description.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection to {} failed: {}", label, e);
            }
        });

        tracing::debug!("Connected to {}", description);

        Ok(Self {
            client,
            description,
        })
    }

    fn schema_of(table: &TableName) -> &str {
        table.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn query(&self, sql: &str, params: &[JsonValue]) -> SyncResult<Vec<Row>> {
        let bound = bind_as_text(params);
        let refs = param_refs(&bound);

        // row_to_json keeps the select-list order, which serde_json preserves
        let wrapped = format!("SELECT row_to_json(q)::text FROM ({}) AS q", sql);
        let rows = self.client.query(&wrapped, &refs).await.map_err(classify)?;

        rows.iter()
            .map(|row| {
                let text: String = row.get(0);
                serde_json::from_str::<Row>(&text)
                    .map_err(|e| SyncError::Statement(format!("Failed to decode row: {}", e)))
            })
            .collect()
    }

    async fn execute(&self, sql: &str, params: &[JsonValue]) -> SyncResult<u64> {
        let bound = bind_as_text(params);
        let refs = param_refs(&bound);
        self.client.execute(sql, &refs).await.map_err(classify)
    }

    async fn begin(&self) -> SyncResult<()> {
        self.client.batch_execute("BEGIN").await.map_err(classify)
    }

    async fn commit(&self) -> SyncResult<()> {
        self.client.batch_execute("COMMIT").await.map_err(classify)
    }

    async fn rollback(&self) -> SyncResult<()> {
        self.client.batch_execute("ROLLBACK").await.map_err(classify)
    }

    async fn table_exists(&self, table: &TableName) -> SyncResult<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1::text AND table_name = $2::text
                )",
                &[&Self::schema_of(table), &table.name],
            )
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn columns_of(&self, table: &TableName) -> SyncResult<Vec<ColumnMetadata>> {
        let primary_key = self.primary_key_of(table).await?;

        let rows = self
            .client
            .query(
                "SELECT c.column_name::text,
                        format_type(a.atttypid, a.atttypmod),
                        c.is_nullable = 'YES',
                        (c.is_identity = 'YES' OR COALESCE(c.column_default, '') LIKE 'nextval(%'),
                        c.character_maximum_length::int4,
                        c.numeric_precision::int4,
                        c.numeric_scale::int4
                 FROM information_schema.columns c
                 JOIN pg_catalog.pg_attribute a
                   ON a.attrelid = format('%I.%I', c.table_schema, c.table_name)::regclass
                  AND a.attname = c.column_name
                 WHERE c.table_schema = $1::text AND c.table_name = $2::text
                 ORDER BY c.ordinal_position",
                &[&Self::schema_of(table), &table.name],
            )
            .await
            .map_err(classify)?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                ColumnMetadata {
                    is_primary_key: primary_key.contains(&name),
                    name,
                    data_type: row.get(1),
                    nullable: row.get(2),
                    is_identity: row.get(3),
                    max_length: row.get(4),
                    precision: row.get(5),
                    scale: row.get(6),
                }
            })
            .collect())
    }

    async fn primary_key_of(&self, table: &TableName) -> SyncResult<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1::text
                   AND c.relname = $2::text
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&Self::schema_of(table), &table.name],
            )
            .await
            .map_err(classify)?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn set_identity_insert(&self, table: &TableName, enabled: bool) -> SyncResult<()> {
        // Explicit identity values are handled per statement with OVERRIDING SYSTEM VALUE
        tracing::debug!("Identity insert {} for {}", if enabled { "on" } else { "off" }, table);
        Ok(())
    }

    async fn after_identity_insert(
        &self,
        table: &TableName,
        columns: &[ColumnMetadata],
    ) -> SyncResult<()> {
        let qualified = Dialect::Postgres.qualified(table);
        for column in columns.iter().filter(|c| c.is_identity) {
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence($1::text, $2::text), COALESCE(MAX({}), 0) + 1, false) FROM {}",
                Dialect::Postgres.quote_ident(&column.name),
                qualified
            );
            self.client
                .query(&sql, &[&qualified, &column.name])
                .await
                .map_err(classify)?;
            tracing::debug!("Resynced sequence for {}.{}", table, column.name);
        }
        Ok(())
    }
}

/// Render JSON parameters as text; placeholders cast them to the column type.
fn bind_as_text(params: &[JsonValue]) -> Vec<Option<String>> {
    params
        .iter()
        .map(|value| match value {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Bool(b) => Some(b.to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        })
        .collect()
}

fn param_refs(bound: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    bound.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Split driver errors into run-fatal connectivity loss and statement failures.
fn classify(err: tokio_postgres::Error) -> SyncError {
    if err.is_closed() {
        return SyncError::Connectivity(err.to_string());
    }

    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        // Class 08 is connection exception, 57P01..03 are server shutdowns
        if code.starts_with("08") || code.starts_with("57P") {
            return SyncError::Connectivity(format!("{} ({})", db.message(), code));
        }
        let mut message = format!("{} ({})", db.message(), code);
        if let Some(detail) = db.detail() {
            message.push_str(": ");
            message.push_str(detail);
        }
        return SyncError::Statement(message);
    }

    let io = std::error::Error::source(&err).is_some_and(|s| s.is::<std::io::Error>());
    if io {
        SyncError::Connectivity(err.to_string())
    } else {
        SyncError::Statement(err.to_string())
    }
}
