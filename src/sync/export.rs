// ABOUTME: Snapshot Exporter - validates a source table, guards key uniqueness and writes its snapshot
// ABOUTME: Applies the duplicate policy (abort, skip, keep-first, resolver) before capturing rows

use super::duplicates::{DuplicateAnalyzer, DuplicateReport, RowIdentity};
use super::resolver::{DecisionSource, DuplicateResolver, Resolution};
use super::snapshot::Snapshot;
use super::sql::build_select;
use crate::config::{DuplicatePolicy, TableSyncSpec};
use crate::error::{SyncError, SyncResult};
use crate::provider::{ColumnMetadata, Connection};
use crate::value::RowKey;
use std::collections::HashSet;
use std::path::PathBuf;

/// What an export produced for one table.
#[derive(Debug, Clone)]
pub enum ExportOutcome {
    Written {
        path: PathBuf,
        row_count: usize,
        /// Rows left out by `keep-first`.
        dropped_duplicates: usize,
        /// Rows deleted from the source by the resolver.
        removed_duplicates: usize,
    },
    /// Duplicates found and the policy was `skip`.
    Skipped { report: DuplicateReport },
}

/// Require `name` to be a column of the table, exactly as spelled.
///
/// A case-insensitive near miss is reported as a hint; more than one near
/// miss makes the name ambiguous.
pub fn require_column(columns: &[ColumnMetadata], name: &str, table: &str) -> SyncResult<()> {
    if columns.iter().any(|c| c.name == name) {
        return Ok(());
    }

    let near: Vec<&str> = columns
        .iter()
        .filter(|c| c.name.eq_ignore_ascii_case(name))
        .map(|c| c.name.as_str())
        .collect();

    let message = match near.as_slice() {
        [] => format!("column '{}' does not exist", name),
        [only] => format!("column '{}' does not exist (did you mean '{}'?)", name, only),
        many => format!(
            "column '{}' is ambiguous, it matches {} ignoring case",
            name,
            many.join(", ")
        ),
    };
    Err(SyncError::validation(table, message))
}

pub struct SnapshotExporter<'a> {
    conn: &'a dyn Connection,
    snapshot_dir: PathBuf,
    policy: DuplicatePolicy,
    max_rounds: usize,
}

impl<'a> SnapshotExporter<'a> {
    pub fn new(conn: &'a dyn Connection, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            conn,
            snapshot_dir: snapshot_dir.into(),
            policy: DuplicatePolicy::default(),
            max_rounds: 5,
        }
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Export one table to its snapshot file.
    ///
    /// # Arguments
    ///
    /// * `spec` - Table to export and how it will be promoted
    /// * `decisions` - Consulted by the resolver under `auto-remove`/`prompt`
    ///
    /// # Errors
    ///
    /// - `Validation` when the table, a referenced column or a usable key is missing
    /// - `DuplicateViolation` when the key is not unique and the policy did not clear it
    /// - `Connectivity` when the source connection is lost
    pub async fn export(
        &self,
        spec: &TableSyncSpec,
        decisions: &mut dyn DecisionSource,
    ) -> SyncResult<ExportOutcome> {
        let label = spec.label();
        let table = &spec.source_table;

        if !self.conn.table_exists(table).await.map_err(|e| e.in_table(&label))? {
            return Err(SyncError::validation(&label, "source table does not exist"));
        }

        let columns = self
            .conn
            .columns_of(table)
            .await
            .map_err(|e| e.in_table(&label))?;
        for name in spec.match_on().iter().chain(spec.ignore_columns()) {
            require_column(&columns, name, &label)?;
        }

        let match_on = self.resolve_match_on(spec, &label).await?;
        let identity = RowIdentity::of(self.conn, table).await.map_err(|e| e.in_table(&label))?;

        let mut keep_first = false;
        let mut removed_duplicates = 0;

        if !spec.is_replace() {
            let check = DuplicateAnalyzer::new(self.conn)
                .check(table, &match_on, spec.export_where.as_deref())
                .await
                .map_err(|e| e.in_table(&label))?;

            if !check.is_unique {
                match self.policy {
                    DuplicatePolicy::Abort => {
                        return Err(SyncError::DuplicateViolation {
                            table: label,
                            report: Box::new(check.report),
                        })
                    }
                    DuplicatePolicy::Skip => {
                        tracing::warn!("Skipping {}: key ({}) is not unique", label, match_on.join(", "));
                        return Ok(ExportOutcome::Skipped {
                            report: check.report,
                        });
                    }
                    DuplicatePolicy::KeepFirst => keep_first = true,
                    DuplicatePolicy::AutoRemove | DuplicatePolicy::Prompt => {
                        let resolver = DuplicateResolver::new(self.conn, table.clone(), match_on.clone())
                            .with_filter(spec.export_where.clone())
                            .with_max_rounds(self.max_rounds);
                        match resolver.resolve(check.report, decisions).await? {
                            Resolution::Resolved { removed, .. } => removed_duplicates = removed,
                            Resolution::Aborted { report } => {
                                return Err(SyncError::DuplicateViolation {
                                    table: label,
                                    report: Box::new(report),
                                })
                            }
                        }
                    }
                }
            }
        }

        let mut order_by: Vec<String> = match_on
            .iter()
            .map(|c| self.conn.dialect().quote_ident(c))
            .collect();
        for expr in identity.order_by(self.conn) {
            if !order_by.contains(&expr) {
                order_by.push(expr);
            }
        }

        let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let sql = build_select(
            self.conn.dialect(),
            table,
            Some(&column_names),
            None,
            spec.export_where.as_deref(),
            &order_by,
        );
        let mut rows = self.conn.query(&sql, &[]).await.map_err(|e| e.in_table(&label))?;

        let mut dropped_duplicates = 0;
        if keep_first {
            let mut seen = HashSet::new();
            let before = rows.len();
            rows.retain(|row| seen.insert(RowKey::from_row(row, &match_on)));
            dropped_duplicates = before - rows.len();
            tracing::warn!(
                "{}: kept the first row of each duplicate group, left {} row(s) out of the snapshot",
                label,
                dropped_duplicates
            );
        }

        let snapshot = Snapshot::capture(spec, match_on, columns, rows);
        let row_count = snapshot.data.len();
        let path = snapshot.save(&self.snapshot_dir)?;

        tracing::info!("✓ Exported {} ({} rows) to {:?}", label, row_count, path);

        Ok(ExportOutcome::Written {
            path,
            row_count,
            dropped_duplicates,
            removed_duplicates,
        })
    }

    async fn resolve_match_on(&self, spec: &TableSyncSpec, label: &str) -> SyncResult<Vec<String>> {
        if spec.is_replace() {
            return Ok(Vec::new());
        }
        if !spec.match_on().is_empty() {
            return Ok(spec.match_on().to_vec());
        }

        let primary_key = self
            .conn
            .primary_key_of(&spec.source_table)
            .await
            .map_err(|e| e.in_table(label))?;
        if primary_key.is_empty() {
            return Err(SyncError::validation(
                label,
                "no match_on configured and the table has no primary key",
            ));
        }
        tracing::debug!("{}: matching on primary key ({})", label, primary_key.join(", "));
        Ok(primary_key)
    }
}
