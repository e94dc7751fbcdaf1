// ABOUTME: Duplicate Analyzer - checks that a key is unique over a table
// ABOUTME: Groups rows by compound key and reports every group with more than one row

use super::sql::{build_select, KeyColumn};
use crate::error::SyncResult;
use crate::provider::{Connection, TableName};
use crate::value::{Row, RowKey};
use serde::Serialize;
use std::collections::HashMap;

/// Rows sharing one key value.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub key: RowKey,
    /// Ordered by row identity, so `rows[0]` is the lowest-key row.
    pub rows: Vec<Row>,
}

/// Key-uniqueness violations found in one table.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub table: String,
    pub match_on: Vec<String>,
    pub groups: Vec<DuplicateGroup>,
    /// Rows belonging to any group, including the one that would be kept.
    pub total_duplicate_rows: usize,
}

impl DuplicateReport {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Rows that auto-removal would delete (all but one per group).
    pub fn removable_rows(&self) -> usize {
        self.groups.iter().map(|g| g.rows.len() - 1).sum()
    }
}

/// Verdict of one analyzer run.
#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    pub is_unique: bool,
    pub report: DuplicateReport,
}

/// Group `rows` by `match_on` and keep the groups with more than one member.
///
/// Groups come out in order of first appearance and rows inside a group keep
/// their input order. NULL key parts group together (see [`RowKey`]).
pub fn find_duplicates(table: &str, rows: &[Row], match_on: &[String]) -> DuplicateReport {
    let mut index: HashMap<RowKey, usize> = HashMap::new();
    let mut groups: Vec<DuplicateGroup> = Vec::new();

    for row in rows {
        let key = RowKey::from_row(row, match_on);
        match index.get(&key) {
            Some(&i) => groups[i].rows.push(row.clone()),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(DuplicateGroup {
                    key,
                    rows: vec![row.clone()],
                });
            }
        }
    }

    groups.retain(|g| g.rows.len() > 1);
    let total_duplicate_rows = groups.iter().map(|g| g.rows.len()).sum();

    DuplicateReport {
        table: table.to_string(),
        match_on: match_on.to_vec(),
        groups,
        total_duplicate_rows,
    }
}

/// How rows of a table are addressed individually: the primary key when there
/// is one, the engine's physical row id otherwise.
#[derive(Debug, Clone)]
pub struct RowIdentity {
    pub columns: Vec<KeyColumn>,
}

impl RowIdentity {
    pub async fn of(conn: &dyn Connection, table: &TableName) -> SyncResult<Self> {
        let primary_key = conn.primary_key_of(table).await?;
        if primary_key.is_empty() {
            return Ok(Self {
                columns: vec![KeyColumn::pseudo(conn.dialect().row_identity())],
            });
        }

        let columns = conn.columns_of(table).await?;
        let key_columns = primary_key
            .iter()
            .filter_map(|name| columns.iter().find(|c| &c.name == name))
            .cloned()
            .map(KeyColumn::real)
            .collect();
        Ok(Self {
            columns: key_columns,
        })
    }

    pub fn is_pseudo(&self) -> bool {
        self.columns.iter().any(|c| c.pseudo)
    }

    /// Column names to read the identity back from a fetched row.
    pub fn row_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| {
                if c.pseudo {
                    crate::provider::ROW_IDENTITY_ALIAS.to_string()
                } else {
                    c.column.name.clone()
                }
            })
            .collect()
    }

    pub fn order_by(&self, conn: &dyn Connection) -> Vec<String> {
        self.columns.iter().map(|c| c.expr(conn.dialect())).collect()
    }

    pub fn key_of(&self, row: &Row) -> RowKey {
        RowKey::from_row(row, &self.row_columns())
    }
}

/// Runs uniqueness checks against a live table. Never mutates.
pub struct DuplicateAnalyzer<'a> {
    conn: &'a dyn Connection,
}

impl<'a> DuplicateAnalyzer<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self { conn }
    }

    /// Check that `match_on` is unique over `table`, optionally restricted by
    /// an SQL predicate.
    pub async fn check(
        &self,
        table: &TableName,
        match_on: &[String],
        filter: Option<&str>,
    ) -> SyncResult<DuplicateCheck> {
        let identity = RowIdentity::of(self.conn, table).await?;
        let pseudo = identity.columns.iter().find(|c| c.pseudo);

        let sql = build_select(
            self.conn.dialect(),
            table,
            None,
            pseudo,
            filter,
            &identity.order_by(self.conn),
        );
        let rows = self.conn.query(&sql, &[]).await?;

        let report = find_duplicates(&table.to_string(), &rows, match_on);

        if report.is_empty() {
            tracing::debug!(
                "{} is unique on ({}) across {} rows",
                table,
                match_on.join(", "),
                rows.len()
            );
        } else {
            tracing::warn!(
                "{} has {} duplicate group(s) on ({}), {} row(s) involved",
                table,
                report.groups.len(),
                match_on.join(", "),
                report.total_duplicate_rows
            );
        }

        Ok(DuplicateCheck {
            is_unique: report.is_empty(),
            report,
        })
    }
}
