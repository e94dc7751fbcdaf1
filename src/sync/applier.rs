// ABOUTME: Change Applier - executes a ChangeSet against the target in one transaction
// ABOUTME: Deletes, then updates, then batched inserts; dry run only counts

use super::detector::ChangeSet;
use super::sql::{
    build_delete, build_delete_all, build_insert, build_insert_defaults, build_update, insert_batch_size,
    KeyColumn,
};
use crate::config::TableSyncSpec;
use crate::error::{SyncError, SyncResult};
use crate::provider::{ColumnMetadata, Connection};
use crate::value::RowKey;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Outcome of applying (or dry-running) one change set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResult {
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    /// Failures that rolled the table back. Counts are zero when non-empty.
    pub errors: Vec<String>,
    /// False for a dry run.
    pub executed: bool,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn dry_run(changes: &ChangeSet) -> Self {
        Self {
            insert_count: changes.inserts.len() as u64,
            update_count: changes.updates.len() as u64,
            delete_count: changes.deletes.len() as u64,
            errors: Vec::new(),
            executed: false,
        }
    }
}

#[derive(Default)]
struct Counts {
    inserted: u64,
    updated: u64,
    deleted: u64,
}

pub struct ChangeApplier<'a> {
    conn: &'a dyn Connection,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self { conn }
    }

    /// Apply `changes` to the target table of `spec`.
    ///
    /// With `execute == false` nothing is sent to the database. Otherwise the
    /// whole change set runs in a single transaction that either commits or is
    /// rolled back; a rolled-back table is reported through
    /// [`ApplyResult::errors`]. Only connectivity loss is returned as `Err`.
    pub async fn apply(&self, changes: &ChangeSet, spec: &TableSyncSpec, execute: bool) -> SyncResult<ApplyResult> {
        let label = spec.label();

        if !execute {
            tracing::info!("[dry run] {}: would apply {}", label, changes.summary());
            return Ok(ApplyResult::dry_run(changes));
        }
        if changes.is_empty() {
            tracing::info!("✓ {}: already up to date", label);
            return Ok(ApplyResult {
                executed: true,
                ..Default::default()
            });
        }

        let columns = self
            .conn
            .columns_of(&spec.target_table)
            .await
            .map_err(|e| e.in_table(&label))?;

        self.conn.begin().await?;
        match self.apply_in_transaction(changes, spec, &columns).await {
            Ok(counts) => {
                self.conn
                    .commit()
                    .await
                    .map_err(|e| e.in_transaction(&label, None))?;
                tracing::info!(
                    "✓ {}: {} inserted, {} updated, {} deleted",
                    label,
                    counts.inserted,
                    counts.updated,
                    counts.deleted
                );
                Ok(ApplyResult {
                    insert_count: counts.inserted,
                    update_count: counts.updated,
                    delete_count: counts.deleted,
                    errors: Vec::new(),
                    executed: true,
                })
            }
            Err(e) => {
                if let Err(rollback_err) = self.conn.rollback().await {
                    tracing::warn!("{}: rollback failed: {}", label, rollback_err);
                }
                if e.is_run_fatal() {
                    return Err(e);
                }
                tracing::error!("✗ {}: {}", label, e);
                Ok(ApplyResult {
                    errors: vec![e.to_string()],
                    executed: true,
                    ..Default::default()
                })
            }
        }
    }

    async fn apply_in_transaction(
        &self,
        changes: &ChangeSet,
        spec: &TableSyncSpec,
        columns: &[ColumnMetadata],
    ) -> SyncResult<Counts> {
        let label = spec.label();
        let target = &spec.target_table;
        let dialect = self.conn.dialect();
        let mut counts = Counts::default();

        if changes.replace {
            if !changes.deletes.is_empty() {
                counts.deleted = self
                    .conn
                    .execute(&build_delete_all(dialect, target), &[])
                    .await
                    .map_err(|e| e.in_transaction(&label, None))?;
            }
        } else {
            let key_columns = key_columns(columns, &changes.key_columns, &label)?;

            for key in &changes.deletes {
                let (sql, params) = build_delete(dialect, target, &key_columns, key);
                self.execute_one(&sql, &params, &label, key, "delete").await?;
                counts.deleted += 1;
            }

            for update in &changes.updates {
                let set_columns = update
                    .changed_columns
                    .iter()
                    .map(|name| find_column(columns, name, &label))
                    .collect::<SyncResult<Vec<_>>>()?;
                let (sql, params) = build_update(dialect, target, &set_columns, &update.new_row, &key_columns, &update.key);
                self.execute_one(&sql, &params, &label, &update.key, "update").await?;
                counts.updated += 1;
            }
        }

        counts.inserted = self.insert_rows(changes, spec, columns).await?;
        Ok(counts)
    }

    /// Run an update/delete that must hit exactly one row.
    async fn execute_one(
        &self,
        sql: &str,
        params: &[JsonValue],
        label: &str,
        key: &RowKey,
        verb: &str,
    ) -> SyncResult<()> {
        let affected = self
            .conn
            .execute(sql, params)
            .await
            .map_err(|e| e.in_transaction(label, Some(key.to_string())))?;
        if affected != 1 {
            return Err(SyncError::transaction(
                label,
                Some(key.to_string()),
                format!(
                    "{} affected {} rows instead of 1, the target changed since detection",
                    verb, affected
                ),
            ));
        }
        Ok(())
    }

    async fn insert_rows(&self, changes: &ChangeSet, spec: &TableSyncSpec, columns: &[ColumnMetadata]) -> SyncResult<u64> {
        let Some(first) = changes.inserts.first() else {
            return Ok(0);
        };
        let label = spec.label();
        let target = &spec.target_table;
        let dialect = self.conn.dialect();
        let preserve = spec.preserve_identity();

        // Match-key columns are always written, otherwise the next detection
        // cannot find the inserted row again.
        let is_match_key = |c: &ColumnMetadata| !changes.replace && changes.key_columns.contains(&c.name);
        let insert_columns: Vec<&ColumnMetadata> = columns
            .iter()
            .filter(|c| first.contains_key(&c.name))
            .filter(|c| preserve || !c.is_identity || is_match_key(*c))
            .collect();
        let identity_columns: Vec<ColumnMetadata> = insert_columns
            .iter()
            .filter(|c| c.is_identity)
            .map(|c| (*c).clone())
            .collect();
        let has_identity = !identity_columns.is_empty();
        if has_identity && !preserve {
            tracing::debug!(
                "{}: writing identity match key {:?} explicitly",
                label,
                identity_columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
            );
        }

        if has_identity {
            self.conn
                .set_identity_insert(target, true)
                .await
                .map_err(|e| e.in_transaction(&label, None))?;
        }

        let mut inserted = 0;
        if insert_columns.is_empty() {
            let sql = build_insert_defaults(dialect, target);
            for _ in &changes.inserts {
                inserted += self
                    .conn
                    .execute(&sql, &[])
                    .await
                    .map_err(|e| e.in_transaction(&label, None))?;
            }
        } else {
            let batch_size = insert_batch_size(dialect, insert_columns.len());
            let identity_override = dialect.identity_override(has_identity);

            for chunk in changes.inserts.chunks(batch_size) {
                let sql = build_insert(dialect, target, &insert_columns, chunk.len(), identity_override);
                let params: Vec<JsonValue> = chunk
                    .iter()
                    .flat_map(|row| {
                        insert_columns
                            .iter()
                            .map(move |c| row.get(&c.name).cloned().unwrap_or(JsonValue::Null))
                    })
                    .collect();

                inserted += self
                    .conn
                    .execute(&sql, &params)
                    .await
                    .map_err(|e| e.in_transaction(&label, None))?;
                tracing::debug!("{}: inserted batch of {} rows", label, chunk.len());
            }
        }

        if has_identity {
            self.conn
                .set_identity_insert(target, false)
                .await
                .map_err(|e| e.in_transaction(&label, None))?;
            self.conn
                .after_identity_insert(target, &identity_columns)
                .await
                .map_err(|e| e.in_transaction(&label, None))?;
        }

        Ok(inserted)
    }
}

fn find_column<'c>(columns: &'c [ColumnMetadata], name: &str, label: &str) -> SyncResult<&'c ColumnMetadata> {
    columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| SyncError::validation(label, format!("target has no column '{}'", name)))
}

fn key_columns(columns: &[ColumnMetadata], names: &[String], label: &str) -> SyncResult<Vec<KeyColumn>> {
    names
        .iter()
        .map(|name| find_column(columns, name, label).map(|c| KeyColumn::real(c.clone())))
        .collect()
}
