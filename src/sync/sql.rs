// ABOUTME: SQL statement builders for reads, keyed updates/deletes and batched inserts
// ABOUTME: Key predicates are null-aware so NULL key parts match with IS NULL

use crate::provider::{ColumnMetadata, Dialect, TableName};
use crate::value::{Row, RowKey};
use serde_json::Value as JsonValue;

/// A column used to address rows: either a real column or a pseudo column
/// such as SQLite's `rowid` / PostgreSQL's `ctid`, which must not be quoted.
#[derive(Debug, Clone)]
pub struct KeyColumn {
    pub column: ColumnMetadata,
    pub pseudo: bool,
}

impl KeyColumn {
    pub fn real(column: ColumnMetadata) -> Self {
        Self {
            column,
            pseudo: false,
        }
    }

    pub fn pseudo(column: ColumnMetadata) -> Self {
        Self {
            column,
            pseudo: true,
        }
    }

    pub fn expr(&self, dialect: Dialect) -> String {
        if self.pseudo {
            self.column.name.clone()
        } else {
            dialect.quote_ident(&self.column.name)
        }
    }
}

/// Build a `SELECT` over `table`.
///
/// ```sql
/// SELECT [<identity> AS "__row_identity", ] <columns | *> FROM "schema"."table"
/// [WHERE (<filter>)] [ORDER BY <order>]
/// ```
pub fn build_select(
    dialect: Dialect,
    table: &TableName,
    columns: Option<&[String]>,
    identity: Option<&KeyColumn>,
    filter: Option<&str>,
    order_by: &[String],
) -> String {
    let mut select_list = Vec::new();
    if let Some(identity) = identity {
        select_list.push(format!(
            "{} AS {}",
            identity.expr(dialect),
            dialect.quote_ident(crate::provider::ROW_IDENTITY_ALIAS)
        ));
    }
    match columns {
        Some(columns) if !columns.is_empty() => {
            select_list.extend(columns.iter().map(|c| dialect.quote_ident(c)));
        }
        _ => select_list.push("*".to_string()),
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list.join(", "),
        dialect.qualified(table)
    );
    if let Some(filter) = filter {
        sql.push_str(&format!(" WHERE ({})", filter));
    }
    if !order_by.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order_by.join(", ")));
    }
    sql
}

/// Null-aware equality predicate for one key, appending bound values to `params`.
///
/// Produces `"a" = $1 AND "b" IS NULL` style text; placeholders continue
/// numbering from the current length of `params`.
pub fn key_predicate(
    dialect: Dialect,
    columns: &[KeyColumn],
    key: &RowKey,
    params: &mut Vec<JsonValue>,
) -> String {
    columns
        .iter()
        .zip(key.values())
        .map(|(col, value)| {
            if value.is_null() {
                format!("{} IS NULL", col.expr(dialect))
            } else {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    col.expr(dialect),
                    dialect.placeholder(params.len(), Some(&col.column))
                )
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Build a single-row delete addressed by `key`.
pub fn build_delete(
    dialect: Dialect,
    table: &TableName,
    key_columns: &[KeyColumn],
    key: &RowKey,
) -> (String, Vec<JsonValue>) {
    let mut params = Vec::new();
    let predicate = key_predicate(dialect, key_columns, key, &mut params);
    (
        format!("DELETE FROM {} WHERE {}", dialect.qualified(table), predicate),
        params,
    )
}

/// Build a delete of every row in `table`.
pub fn build_delete_all(dialect: Dialect, table: &TableName) -> String {
    format!("DELETE FROM {}", dialect.qualified(table))
}

/// Build an update that sets only `set_columns`, addressed by `key`.
///
/// ```sql
/// UPDATE "t" SET "email" = $1, "name" = $2 WHERE "id" = $3
/// ```
pub fn build_update(
    dialect: Dialect,
    table: &TableName,
    set_columns: &[&ColumnMetadata],
    row: &Row,
    key_columns: &[KeyColumn],
    key: &RowKey,
) -> (String, Vec<JsonValue>) {
    let mut params = Vec::with_capacity(set_columns.len() + key_columns.len());
    let assignments: Vec<String> = set_columns
        .iter()
        .map(|col| {
            params.push(row.get(&col.name).cloned().unwrap_or(JsonValue::Null));
            format!(
                "{} = {}",
                dialect.quote_ident(&col.name),
                dialect.placeholder(params.len(), Some(col))
            )
        })
        .collect();

    let predicate = key_predicate(dialect, key_columns, key, &mut params);

    (
        format!(
            "UPDATE {} SET {} WHERE {}",
            dialect.qualified(table),
            assignments.join(", "),
            predicate
        ),
        params,
    )
}

/// Build a multi-row insert for `num_rows` rows of `columns`.
///
/// ```sql
/// INSERT INTO "t" ("id", "name") [OVERRIDING SYSTEM VALUE] VALUES ($1, $2), ($3, $4)
/// ```
pub fn build_insert(
    dialect: Dialect,
    table: &TableName,
    columns: &[&ColumnMetadata],
    num_rows: usize,
    identity_override: Option<&str>,
) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| dialect.quote_ident(&c.name)).collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(col_idx, col)| dialect.placeholder(row_idx * num_cols + col_idx + 1, Some(col)))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({})",
        dialect.qualified(table),
        quoted.join(", ")
    );
    if let Some(clause) = identity_override {
        sql.push(' ');
        sql.push_str(clause);
    }
    sql.push_str(&format!(" VALUES {}", value_rows.join(", ")));
    sql
}

/// Insert for a row with no explicit columns at all.
pub fn build_insert_defaults(dialect: Dialect, table: &TableName) -> String {
    format!("INSERT INTO {} DEFAULT VALUES", dialect.qualified(table))
}

/// Rows per insert statement so that a batch stays under the parameter limit.
pub fn insert_batch_size(dialect: Dialect, num_cols: usize) -> usize {
    std::cmp::max(1, dialect.max_params() / std::cmp::max(1, num_cols))
}
