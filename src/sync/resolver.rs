// ABOUTME: Duplicate Resolver - state machine that clears key duplicates from a live table
// ABOUTME: Decisions come from an injected DecisionSource; auto-removal runs in one transaction

use super::duplicates::{DuplicateAnalyzer, DuplicateReport, RowIdentity};
use super::sql::build_delete;
use crate::error::{SyncError, SyncResult};
use crate::provider::{Connection, Dialect, TableName};
use std::collections::VecDeque;

/// What to do with a non-unique table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Show the groups, then ask again.
    List,
    /// Keep the lowest-key row of each group and delete the rest.
    AutoRemove,
    /// Stop without touching the table.
    Abort,
}

/// Supplies decisions to the resolver.
///
/// Terminal prompts, fixed policies and test scripts all implement this, so
/// the state machine itself never talks to a user.
pub trait DecisionSource: Send {
    fn decide(&mut self, report: &DuplicateReport) -> Decision;

    /// Present the duplicate groups. Called when the decision was [`Decision::List`].
    fn list(&mut self, report: &DuplicateReport) {
        for group in &report.groups {
            tracing::info!(
                "  {} ({}) = {}: {} rows",
                report.table,
                report.match_on.join(", "),
                group.key,
                group.rows.len()
            );
        }
    }
}

/// Always answers with the same decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub Decision);

impl DecisionSource for FixedDecision {
    fn decide(&mut self, _report: &DuplicateReport) -> Decision {
        self.0
    }
}

/// Answers from a queue, then repeats `fallback` forever.
#[derive(Debug, Clone)]
pub struct ScriptedDecisions {
    queue: VecDeque<Decision>,
    fallback: Decision,
    /// How many times the groups were listed.
    pub listed: usize,
}

impl ScriptedDecisions {
    pub fn new(decisions: impl IntoIterator<Item = Decision>, fallback: Decision) -> Self {
        Self {
            queue: decisions.into_iter().collect(),
            fallback,
            listed: 0,
        }
    }
}

impl DecisionSource for ScriptedDecisions {
    fn decide(&mut self, _report: &DuplicateReport) -> Decision {
        self.queue.pop_front().unwrap_or(self.fallback)
    }

    fn list(&mut self, _report: &DuplicateReport) {
        self.listed += 1;
    }
}

/// Resolver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Detected,
    Listing,
    AutoRemoving,
    Resolved,
    Aborted,
}

/// Terminal result of a resolver run.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved { removed: usize, rounds: usize },
    Aborted { report: DuplicateReport },
}

enum RemoveOutcome {
    Unique(usize),
    StillDuplicated,
}

/// Drives one table from "duplicates detected" to resolved or aborted.
pub struct DuplicateResolver<'a> {
    conn: &'a dyn Connection,
    table: TableName,
    match_on: Vec<String>,
    filter: Option<String>,
    max_rounds: usize,
}

impl<'a> DuplicateResolver<'a> {
    pub fn new(conn: &'a dyn Connection, table: TableName, match_on: Vec<String>) -> Self {
        Self {
            conn,
            table,
            match_on,
            filter: None,
            max_rounds: 5,
        }
    }

    /// Restrict the re-check to rows matching `filter`.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Run the state machine from `Detected` until it reaches a terminal state.
    ///
    /// Every visit to `Detected` consumes one round; running out of rounds
    /// aborts. A failed auto-removal rolls back, re-analyzes the table and
    /// returns to `Detected` with the fresh report, or straight to `Resolved`
    /// when the table became unique in the meantime. Connectivity loss and
    /// validation failures are returned as errors.
    pub async fn resolve(
        &self,
        initial: DuplicateReport,
        decisions: &mut dyn DecisionSource,
    ) -> SyncResult<Resolution> {
        let mut report = initial;
        let mut state = ResolverState::Detected;
        let mut rounds = 0;
        let mut removed = 0;

        loop {
            tracing::debug!("{}: resolver state {:?}", self.table, state);
            state = match state {
                ResolverState::Detected => {
                    if rounds >= self.max_rounds {
                        tracing::warn!(
                            "{}: no resolution after {} round(s), aborting",
                            self.table,
                            rounds
                        );
                        ResolverState::Aborted
                    } else {
                        rounds += 1;
                        match decisions.decide(&report) {
                            Decision::List => ResolverState::Listing,
                            Decision::AutoRemove => ResolverState::AutoRemoving,
                            Decision::Abort => ResolverState::Aborted,
                        }
                    }
                }
                ResolverState::Listing => {
                    decisions.list(&report);
                    ResolverState::Detected
                }
                ResolverState::AutoRemoving => match self.auto_remove(&report).await {
                    Ok(RemoveOutcome::Unique(count)) => {
                        removed = count;
                        ResolverState::Resolved
                    }
                    Ok(RemoveOutcome::StillDuplicated) => {
                        tracing::warn!(
                            "{}: still not unique after removal, changes rolled back",
                            self.table
                        );
                        self.after_rollback(&mut report).await?
                    }
                    Err(e @ SyncError::Connectivity(_)) | Err(e @ SyncError::Validation { .. }) => {
                        return Err(e)
                    }
                    Err(e) => {
                        tracing::warn!("{}: auto-removal failed: {}", self.table, e);
                        self.after_rollback(&mut report).await?
                    }
                },
                ResolverState::Resolved => {
                    tracing::info!(
                        "✓ {}: removed {} duplicate row(s), key is now unique",
                        self.table,
                        removed
                    );
                    return Ok(Resolution::Resolved { removed, rounds });
                }
                ResolverState::Aborted => return Ok(Resolution::Aborted { report }),
            };
        }
    }

    /// Re-analyze after a rolled-back removal so the next round works on the
    /// table as it is now.
    async fn after_rollback(&self, report: &mut DuplicateReport) -> SyncResult<ResolverState> {
        let check = DuplicateAnalyzer::new(self.conn)
            .check(&self.table, &self.match_on, self.filter.as_deref())
            .await?;
        if check.is_unique {
            tracing::info!("{}: key became unique outside the resolver", self.table);
            return Ok(ResolverState::Resolved);
        }
        *report = check.report;
        Ok(ResolverState::Detected)
    }

    async fn auto_remove(&self, report: &DuplicateReport) -> SyncResult<RemoveOutcome> {
        let identity = RowIdentity::of(self.conn, &self.table).await?;
        if identity.is_pseudo() && self.conn.dialect() == Dialect::Postgres {
            return Err(SyncError::validation(
                self.table.to_string(),
                "duplicates cannot be removed automatically from a table without a primary key",
            ));
        }

        self.conn.begin().await?;
        match self.delete_extras(report, &identity).await {
            Ok(RemoveOutcome::Unique(count)) => {
                self.conn.commit().await?;
                Ok(RemoveOutcome::Unique(count))
            }
            Ok(RemoveOutcome::StillDuplicated) => {
                self.conn.rollback().await?;
                Ok(RemoveOutcome::StillDuplicated)
            }
            Err(e) => {
                if let Err(rollback_err) = self.conn.rollback().await {
                    tracing::warn!("{}: rollback failed: {}", self.table, rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn delete_extras(
        &self,
        report: &DuplicateReport,
        identity: &RowIdentity,
    ) -> SyncResult<RemoveOutcome> {
        let label = self.table.to_string();
        let mut removed = 0;

        for group in &report.groups {
            for row in group.rows.iter().skip(1) {
                let key = identity.key_of(row);
                let (sql, params) =
                    build_delete(self.conn.dialect(), &self.table, &identity.columns, &key);
                let affected = self
                    .conn
                    .execute(&sql, &params)
                    .await
                    .map_err(|e| e.in_transaction(&label, Some(key.to_string())))?;
                if affected != 1 {
                    return Err(SyncError::transaction(
                        &label,
                        Some(key.to_string()),
                        format!("expected to delete 1 row, deleted {}", affected),
                    ));
                }
                removed += 1;
            }
        }

        let check = DuplicateAnalyzer::new(self.conn)
            .check(&self.table, &self.match_on, self.filter.as_deref())
            .await?;
        if check.is_unique {
            Ok(RemoveOutcome::Unique(removed))
        } else {
            Ok(RemoveOutcome::StillDuplicated)
        }
    }
}
