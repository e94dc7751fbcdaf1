// ABOUTME: Change Detector - diffs a snapshot against the live target table by key
// ABOUTME: Produces inserts, column-level updates and deletes; replace mode swaps the whole table

use super::duplicates::{find_duplicates, DuplicateAnalyzer};
use super::export::require_column;
use super::snapshot::Snapshot;
use super::sql::build_select;
use crate::config::{SyncMode, TableSyncSpec};
use crate::error::{SyncError, SyncResult};
use crate::provider::{ColumnMetadata, Connection};
use crate::value::{row_fingerprint, values_equal, Row, RowKey};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

static NULL: JsonValue = JsonValue::Null;

/// One target row that needs new values.
#[derive(Debug, Clone, Serialize)]
pub struct RowUpdate {
    pub key: RowKey,
    /// Only the columns whose values differ, in snapshot column order.
    pub changed_columns: Vec<String>,
    pub new_row: Row,
}

/// Everything needed to bring one target table in line with its snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    pub table: String,
    /// Replace mode: `deletes` covers the whole table and the applier clears it.
    pub replace: bool,
    pub key_columns: Vec<String>,
    pub inserts: Vec<Row>,
    pub updates: Vec<RowUpdate>,
    pub deletes: Vec<RowKey>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} insert(s), {} update(s), {} delete(s)",
            self.inserts.len(),
            self.updates.len(),
            self.deletes.len()
        )
    }
}

/// Key-based diff settings.
#[derive(Debug, Clone)]
pub struct DiffRules {
    pub match_on: Vec<String>,
    pub ignore_columns: Vec<String>,
    pub allow_inserts: bool,
    pub allow_updates: bool,
    pub allow_deletes: bool,
}

impl DiffRules {
    pub fn new(match_on: &[&str]) -> Self {
        Self {
            match_on: match_on.iter().map(|c| c.to_string()).collect(),
            ignore_columns: Vec::new(),
            allow_inserts: true,
            allow_updates: true,
            allow_deletes: false,
        }
    }

    fn compares(&self, column: &str) -> bool {
        !self.match_on.iter().any(|c| c == column) && !self.ignore_columns.iter().any(|c| c == column)
    }
}

/// Diff `snapshot_rows` against `target_rows` by key.
///
/// Both sides must already be unique on `rules.match_on`. Only `columns`
/// (the snapshot's columns) are compared, minus keys and ignored columns.
/// Disallowed operations are left out of the result rather than reported.
pub fn diff_rows(
    table: &str,
    columns: &[String],
    snapshot_rows: &[Row],
    target_rows: &[Row],
    rules: &DiffRules,
) -> ChangeSet {
    let index: HashMap<RowKey, usize> = target_rows
        .iter()
        .enumerate()
        .map(|(i, row)| (RowKey::from_row(row, &rules.match_on), i))
        .collect();
    let mut visited = vec![false; target_rows.len()];

    let compared: Vec<&String> = columns.iter().filter(|c| rules.compares(c)).collect();

    let mut changes = ChangeSet {
        table: table.to_string(),
        replace: false,
        key_columns: rules.match_on.clone(),
        ..Default::default()
    };

    for row in snapshot_rows {
        let key = RowKey::from_row(row, &rules.match_on);
        match index.get(&key) {
            Some(&i) => {
                visited[i] = true;
                let target = &target_rows[i];
                let changed_columns: Vec<String> = compared
                    .iter()
                    .filter(|c| {
                        let new = row.get(c.as_str()).unwrap_or(&NULL);
                        let old = target.get(c.as_str()).unwrap_or(&NULL);
                        !values_equal(new, old)
                    })
                    .map(|c| c.to_string())
                    .collect();

                if !changed_columns.is_empty() && rules.allow_updates {
                    changes.updates.push(RowUpdate {
                        key,
                        changed_columns,
                        new_row: row.clone(),
                    });
                }
            }
            None => {
                if rules.allow_inserts {
                    changes.inserts.push(row.clone());
                }
            }
        }
    }

    if rules.allow_deletes {
        changes.deletes = target_rows
            .iter()
            .zip(&visited)
            .filter(|(_, seen)| !**seen)
            .map(|(row, _)| RowKey::from_row(row, &rules.match_on))
            .collect();
    }

    changes
}

/// Replace-mode change set: drop every target row and load every snapshot row.
///
/// When the target already holds exactly the snapshot's rows (as a multiset
/// over `columns`) the result is empty.
pub fn replace_rows(table: &str, columns: &[String], snapshot_rows: &[Row], target_rows: &[Row]) -> ChangeSet {
    let mut changes = ChangeSet {
        table: table.to_string(),
        replace: true,
        key_columns: columns.to_vec(),
        ..Default::default()
    };

    if snapshot_rows.len() == target_rows.len() {
        let mut counts: HashMap<Vec<Option<String>>, i64> = HashMap::new();
        for row in snapshot_rows {
            *counts.entry(row_fingerprint(row, columns)).or_default() += 1;
        }
        for row in target_rows {
            *counts.entry(row_fingerprint(row, columns)).or_default() -= 1;
        }
        if counts.values().all(|n| *n == 0) {
            return changes;
        }
    }

    changes.deletes = target_rows.iter().map(|r| RowKey::from_row(r, columns)).collect();
    changes.inserts = snapshot_rows.to_vec();
    changes
}

/// Columns a replace-mode comparison looks at. Identity columns are left out
/// unless their values are preserved, since the target generates its own.
pub fn fingerprint_columns(columns: &[String], target_columns: &[ColumnMetadata], preserve_identity: bool) -> Vec<String> {
    columns
        .iter()
        .filter(|name| {
            preserve_identity
                || !target_columns
                    .iter()
                    .any(|c| &c.name == *name && c.is_identity)
        })
        .cloned()
        .collect()
}

/// Compares a snapshot with the live target.
pub struct ChangeDetector<'a> {
    conn: &'a dyn Connection,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self { conn }
    }

    /// Compute the change set for `spec` from `snapshot`. Never mutates.
    ///
    /// # Errors
    ///
    /// - `Validation` when the target or one of the snapshot's columns is
    ///   missing, when the snapshot and config disagree on mode or key, or
    ///   when the snapshot itself holds duplicate keys
    /// - `TargetKeyNotUnique` when the target has duplicate keys
    pub async fn detect(&self, snapshot: &Snapshot, spec: &TableSyncSpec) -> SyncResult<ChangeSet> {
        let label = spec.label();
        let target = &spec.target_table;
        let meta = &snapshot.metadata;

        if meta.replace_mode != spec.is_replace() {
            return Err(SyncError::validation(
                &label,
                "snapshot and configuration disagree on replace_mode, export again",
            ));
        }

        if !self.conn.table_exists(target).await.map_err(|e| e.in_table(&label))? {
            return Err(SyncError::validation(
                &label,
                format!("target table {} does not exist", target),
            ));
        }

        let target_columns = self.conn.columns_of(target).await.map_err(|e| e.in_table(&label))?;
        let columns = snapshot.column_names();
        for name in &columns {
            require_column(&target_columns, name, &label)?;
        }

        let rules = match &spec.mode {
            SyncMode::Replace(_) => None,
            SyncMode::Keyed(keyed) => {
                let match_on = self.resolve_match_on(snapshot, spec, &label)?;
                Some(DiffRules {
                    match_on,
                    ignore_columns: keyed.ignore_columns.clone(),
                    allow_inserts: keyed.allow_inserts,
                    allow_updates: keyed.allow_updates,
                    allow_deletes: keyed.allow_deletes,
                })
            }
        };

        if let Some(rules) = &rules {
            let in_snapshot = find_duplicates(&label, &snapshot.data, &rules.match_on);
            if !in_snapshot.is_empty() {
                return Err(SyncError::validation(
                    &label,
                    format!(
                        "snapshot holds {} duplicate key group(s) on ({})",
                        in_snapshot.groups.len(),
                        rules.match_on.join(", ")
                    ),
                ));
            }

            let check = DuplicateAnalyzer::new(self.conn)
                .check(target, &rules.match_on, None)
                .await
                .map_err(|e| e.in_table(&label))?;
            if !check.is_unique {
                return Err(SyncError::TargetKeyNotUnique {
                    table: label,
                    report: Box::new(check.report),
                });
            }
        }

        let order_by: Vec<String> = rules
            .as_ref()
            .map(|r| r.match_on.iter().map(|c| self.conn.dialect().quote_ident(c)).collect())
            .unwrap_or_default();
        let sql = build_select(self.conn.dialect(), target, Some(&columns), None, None, &order_by);
        let target_rows = self.conn.query(&sql, &[]).await.map_err(|e| e.in_table(&label))?;

        let changes = match &rules {
            Some(rules) => diff_rows(&label, &columns, &snapshot.data, &target_rows, rules),
            None => {
                let compared = fingerprint_columns(&columns, &target_columns, spec.preserve_identity());
                replace_rows(&label, &compared, &snapshot.data, &target_rows)
            }
        };

        tracing::info!("{}: {}", label, changes.summary());
        Ok(changes)
    }

    fn resolve_match_on(&self, snapshot: &Snapshot, spec: &TableSyncSpec, label: &str) -> SyncResult<Vec<String>> {
        let from_snapshot = &snapshot.metadata.match_on;
        let match_on = if spec.match_on().is_empty() {
            from_snapshot.clone()
        } else if spec.match_on() != from_snapshot.as_slice() {
            return Err(SyncError::validation(
                label,
                format!(
                    "snapshot was exported with match_on ({}) but the configuration says ({}), export again",
                    from_snapshot.join(", "),
                    spec.match_on().join(", ")
                ),
            ));
        } else {
            spec.match_on().to_vec()
        };

        if match_on.is_empty() {
            return Err(SyncError::validation(label, "snapshot has no match_on key"));
        }
        let columns = &snapshot.metadata.columns;
        for name in &match_on {
            require_column(columns, name, label)?;
        }
        Ok(match_on)
    }
}
