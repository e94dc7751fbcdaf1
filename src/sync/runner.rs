// ABOUTME: Per-table orchestration of export, import and duplicate checks across a run
// ABOUTME: Scopes failures to one table, stops the run on connectivity loss or cancellation

use super::applier::{ApplyResult, ChangeApplier};
use super::detector::{ChangeDetector, ChangeSet};
use super::duplicates::{DuplicateAnalyzer, DuplicateReport};
use super::export::{ExportOutcome, SnapshotExporter};
use super::resolver::{DecisionSource, DuplicateResolver, Resolution};
use super::snapshot::Snapshot;
use crate::config::{DuplicatePolicy, TableSyncSpec};
use crate::error::{SyncError, SyncResult};
use crate::provider::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result code of one table in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableStatus {
    /// Snapshot written.
    Exported,
    /// Duplicate check found the key unique.
    Unique,
    NoChanges,
    ChangesApplied,
    /// Changes computed, not applied.
    DryRun,
    ValidationFailed,
    DuplicateBlocked,
    TransactionFailed,
    Skipped,
    NotRun,
}

impl TableStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TableStatus::ValidationFailed
                | TableStatus::DuplicateBlocked
                | TableStatus::TransactionFailed
                | TableStatus::NotRun
        )
    }
}

/// What happened to one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub status: TableStatus,
    pub message: Option<String>,
    pub changes: Option<ChangeSet>,
    pub apply: Option<ApplyResult>,
    pub duplicates: Option<DuplicateReport>,
    pub snapshot_path: Option<PathBuf>,
    pub row_count: Option<usize>,
}

impl TableOutcome {
    pub fn new(table: impl Into<String>, status: TableStatus) -> Self {
        Self {
            table: table.into(),
            status,
            message: None,
            changes: None,
            apply: None,
            duplicates: None,
            snapshot_path: None,
            row_count: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Map a table-scoped error to its result code.
    pub fn from_error(table: &str, err: SyncError) -> Self {
        let message = err.to_string();
        let outcome = match err {
            SyncError::DuplicateViolation { report, .. } | SyncError::TargetKeyNotUnique { report, .. } => {
                let mut outcome = TableOutcome::new(table, TableStatus::DuplicateBlocked);
                outcome.duplicates = Some(*report);
                outcome
            }
            SyncError::Transaction { .. } => TableOutcome::new(table, TableStatus::TransactionFailed),
            SyncError::Validation { .. }
            | SyncError::Statement(_)
            | SyncError::Snapshot { .. }
            | SyncError::Connectivity(_) => TableOutcome::new(table, TableStatus::ValidationFailed),
        };
        outcome.with_message(message)
    }
}

/// Aggregated outcomes of a run, in configuration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<TableOutcome>,
    /// Set when connectivity loss stopped the run.
    pub fatal: Option<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.status.is_failure())
    }

    /// 0 success, 1 any table failed, 2 run-fatal error.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            2
        } else if self.has_failures() {
            1
        } else {
            0
        }
    }

    pub fn count(&self, status: TableStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    fn abort(&mut self, err: SyncError, remaining: &[TableSyncSpec]) {
        tracing::error!("✗ Run aborted: {}", err);
        let message = err.to_string();
        for spec in remaining {
            self.outcomes
                .push(TableOutcome::new(spec.label(), TableStatus::NotRun).with_message(message.clone()));
        }
        self.fatal = Some(message);
    }

    fn cancel(&mut self, remaining: &[TableSyncSpec]) {
        tracing::warn!("Run cancelled, {} table(s) not processed", remaining.len());
        for spec in remaining {
            self.outcomes
                .push(TableOutcome::new(spec.label(), TableStatus::NotRun).with_message("cancelled"));
        }
        self.cancelled = true;
    }
}

/// Settings shared by every table in a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub snapshot_dir: PathBuf,
    pub policy: DuplicatePolicy,
    pub max_resolve_rounds: usize,
    /// Import only: apply changes instead of reporting them.
    pub execute: bool,
    /// Checked before each table starts.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            policy: DuplicatePolicy::default(),
            max_resolve_rounds: 5,
            execute: false,
            cancel: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Which database a duplicate check looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Side {
    Source,
    Target,
}

/// Export every table in `specs` from `source`, one after another.
pub async fn export_tables(
    source: &dyn Connection,
    specs: &[TableSyncSpec],
    options: &RunOptions,
    decisions: &mut dyn DecisionSource,
) -> RunReport {
    let mut report = RunReport::default();
    let exporter = SnapshotExporter::new(source, &options.snapshot_dir)
        .with_policy(options.policy)
        .with_max_rounds(options.max_resolve_rounds);

    for (i, spec) in specs.iter().enumerate() {
        if options.is_cancelled() {
            report.cancel(&specs[i..]);
            break;
        }

        let label = spec.label();
        tracing::info!("Exporting {}...", label);

        match exporter.export(spec, decisions).await {
            Ok(ExportOutcome::Written {
                path,
                row_count,
                dropped_duplicates,
                removed_duplicates,
            }) => {
                let mut outcome = TableOutcome::new(&label, TableStatus::Exported);
                if dropped_duplicates > 0 {
                    outcome = outcome.with_message(format!(
                        "{} duplicate row(s) left out (keep-first)",
                        dropped_duplicates
                    ));
                } else if removed_duplicates > 0 {
                    outcome = outcome.with_message(format!(
                        "{} duplicate row(s) removed from source",
                        removed_duplicates
                    ));
                }
                outcome.snapshot_path = Some(path);
                outcome.row_count = Some(row_count);
                report.outcomes.push(outcome);
            }
            Ok(ExportOutcome::Skipped { report: duplicates }) => {
                let mut outcome = TableOutcome::new(&label, TableStatus::Skipped)
                    .with_message("key is not unique, skipped by policy");
                outcome.duplicates = Some(duplicates);
                report.outcomes.push(outcome);
            }
            Err(e) if e.is_run_fatal() => {
                report.abort(e, &specs[i..]);
                break;
            }
            Err(e) => {
                tracing::error!("✗ {}: {}", label, e);
                report.outcomes.push(TableOutcome::from_error(&label, e));
            }
        }
    }

    report
}

/// Detect and (when `options.execute`) apply changes for every table in
/// `specs`, reading snapshots from `options.snapshot_dir`.
pub async fn import_tables(
    target: &dyn Connection,
    specs: &[TableSyncSpec],
    options: &RunOptions,
    decisions: &mut dyn DecisionSource,
) -> RunReport {
    let mut report = RunReport::default();

    for (i, spec) in specs.iter().enumerate() {
        if options.is_cancelled() {
            report.cancel(&specs[i..]);
            break;
        }

        let label = spec.label();
        tracing::info!("Importing {}...", label);

        match import_one(target, spec, options, decisions).await {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(e) if e.is_run_fatal() => {
                report.abort(e, &specs[i..]);
                break;
            }
            Err(e) => {
                tracing::error!("✗ {}: {}", label, e);
                report.outcomes.push(TableOutcome::from_error(&label, e));
            }
        }
    }

    report
}

async fn import_one(
    target: &dyn Connection,
    spec: &TableSyncSpec,
    options: &RunOptions,
    decisions: &mut dyn DecisionSource,
) -> SyncResult<TableOutcome> {
    let label = spec.label();
    let path = Snapshot::path_for(&options.snapshot_dir, &label);
    let snapshot = Snapshot::load(&path)?;
    if snapshot.metadata.source_table != label {
        return Err(SyncError::validation(
            &label,
            format!("{:?} holds a snapshot of {}", path, snapshot.metadata.source_table),
        ));
    }

    let detector = ChangeDetector::new(target);
    let changes = match detector.detect(&snapshot, spec).await {
        Err(SyncError::TargetKeyNotUnique { report, .. }) if options.policy == DuplicatePolicy::Skip => {
            let mut outcome = TableOutcome::new(&label, TableStatus::Skipped)
                .with_message("target key is not unique, skipped by policy");
            outcome.duplicates = Some(*report);
            return Ok(outcome);
        }
        Err(SyncError::TargetKeyNotUnique { table, report })
            if options.execute
                && matches!(options.policy, DuplicatePolicy::AutoRemove | DuplicatePolicy::Prompt) =>
        {
            let resolver = DuplicateResolver::new(target, spec.target_table.clone(), report.match_on.clone())
                .with_max_rounds(options.max_resolve_rounds);
            match resolver.resolve(*report, decisions).await? {
                Resolution::Resolved { .. } => detector.detect(&snapshot, spec).await?,
                Resolution::Aborted { report } => {
                    return Err(SyncError::TargetKeyNotUnique {
                        table,
                        report: Box::new(report),
                    })
                }
            }
        }
        other => other?,
    };

    let apply = ChangeApplier::new(target).apply(&changes, spec, options.execute).await?;

    let mut outcome = if !apply.is_success() {
        TableOutcome::new(&label, TableStatus::TransactionFailed).with_message(apply.errors.join("; "))
    } else if changes.is_empty() {
        TableOutcome::new(&label, TableStatus::NoChanges)
    } else if !apply.executed {
        TableOutcome::new(&label, TableStatus::DryRun).with_message(changes.summary())
    } else {
        TableOutcome::new(&label, TableStatus::ChangesApplied).with_message(changes.summary())
    };
    outcome.snapshot_path = Some(path);
    outcome.row_count = Some(snapshot.data.len());
    outcome.changes = Some(changes);
    outcome.apply = Some(apply);
    Ok(outcome)
}

/// Report key uniqueness for every table on one side. Never mutates.
pub async fn check_duplicates(conn: &dyn Connection, specs: &[TableSyncSpec], side: Side) -> RunReport {
    let mut report = RunReport::default();

    for (i, spec) in specs.iter().enumerate() {
        let label = spec.label();
        match check_one(conn, spec, side).await {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(e) if e.is_run_fatal() => {
                report.abort(e, &specs[i..]);
                break;
            }
            Err(e) => report.outcomes.push(TableOutcome::from_error(&label, e)),
        }
    }

    report
}

async fn check_one(conn: &dyn Connection, spec: &TableSyncSpec, side: Side) -> SyncResult<TableOutcome> {
    let label = spec.label();
    if spec.is_replace() {
        return Ok(TableOutcome::new(&label, TableStatus::Skipped).with_message("replace mode has no key"));
    }

    let (table, filter) = match side {
        Side::Source => (&spec.source_table, spec.export_where.as_deref()),
        Side::Target => (&spec.target_table, None),
    };
    if !conn.table_exists(table).await.map_err(|e| e.in_table(&label))? {
        return Err(SyncError::validation(&label, format!("table {} does not exist", table)));
    }

    let match_on = if spec.match_on().is_empty() {
        conn.primary_key_of(table).await.map_err(|e| e.in_table(&label))?
    } else {
        spec.match_on().to_vec()
    };
    if match_on.is_empty() {
        return Err(SyncError::validation(
            &label,
            "no match_on configured and the table has no primary key",
        ));
    }

    let check = DuplicateAnalyzer::new(conn)
        .check(table, &match_on, filter)
        .await
        .map_err(|e| e.in_table(&label))?;

    if check.is_unique {
        Ok(TableOutcome::new(&label, TableStatus::Unique))
    } else {
        let mut outcome = TableOutcome::new(&label, TableStatus::DuplicateBlocked).with_message(format!(
            "{} duplicate group(s) on ({})",
            check.report.groups.len(),
            match_on.join(", ")
        ));
        outcome.duplicates = Some(check.report);
        Ok(outcome)
    }
}
