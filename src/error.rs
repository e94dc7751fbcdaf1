// ABOUTME: Error taxonomy for the promotion engine
// ABOUTME: Separates table-scoped failures from run-fatal connectivity loss

use crate::sync::duplicates::DuplicateReport;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Everything that can go wrong while exporting or importing a table.
///
/// Only [`SyncError::Connectivity`] is fatal to a whole run. Every other
/// variant is scoped to the table named inside it, and the runner moves on to
/// the next table after recording it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing table or column, unusable key, stale snapshot.
    #[error("validation failed for {table}: {message}")]
    Validation { table: String, message: String },

    /// The source key is not unique and the duplicate policy did not clear it.
    #[error(
        "duplicate key values in {table} on ({}): {} group(s), {} row(s)",
        .report.match_on.join(", "),
        .report.groups.len(),
        .report.total_duplicate_rows
    )]
    DuplicateViolation {
        table: String,
        report: Box<DuplicateReport>,
    },

    /// The target key is not unique, so diffing against it is unsafe.
    #[error(
        "target table {table} is not unique on ({}): {} group(s) must be resolved before changes can be detected",
        .report.match_on.join(", "),
        .report.groups.len()
    )]
    TargetKeyNotUnique {
        table: String,
        report: Box<DuplicateReport>,
    },

    /// Lost or failed connection. Aborts the run.
    #[error("connection failure: {0}")]
    Connectivity(String),

    /// A statement inside a table transaction failed; the transaction was rolled back.
    #[error("transaction on {table} rolled back{}: {message}", .key.as_ref().map(|k| format!(" at key {}", k)).unwrap_or_default())]
    Transaction {
        table: String,
        key: Option<String>,
        message: String,
    },

    /// A provider-level statement error before the engine attached table context.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The snapshot file could not be read, written or trusted.
    #[error("snapshot {path:?}: {message}")]
    Snapshot { path: PathBuf, message: String },
}

impl SyncError {
    pub fn validation(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn transaction(table: impl Into<String>, key: Option<String>, message: impl Into<String>) -> Self {
        SyncError::Transaction {
            table: table.into(),
            key,
            message: message.into(),
        }
    }

    pub fn snapshot(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SyncError::Snapshot {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the whole run must stop rather than move to the next table.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }

    /// Attach table context to a bare provider statement error.
    ///
    /// Statement failures outside a transaction (introspection, reads) are
    /// reported as validation failures of the table.
    pub fn in_table(self, table: &str) -> Self {
        match self {
            SyncError::Statement(message) => SyncError::validation(table, message),
            other => other,
        }
    }

    /// Attach table and key context to a statement error raised inside a transaction.
    pub fn in_transaction(self, table: &str, key: Option<String>) -> Self {
        match self {
            SyncError::Statement(message) => SyncError::transaction(table, key, message),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_run_fatal() {
        assert!(SyncError::Connectivity("reset by peer".into()).is_run_fatal());
        assert!(!SyncError::validation("users", "missing column").is_run_fatal());
        assert!(!SyncError::transaction("users", None, "constraint").is_run_fatal());
        assert!(!SyncError::Statement("syntax".into()).is_run_fatal());
    }

    #[test]
    fn test_statement_gains_table_context() {
        let err = SyncError::Statement("no such column: foo".into()).in_table("users");
        assert!(matches!(err, SyncError::Validation { ref table, .. } if table == "users"));

        let err = SyncError::Statement("UNIQUE constraint failed".into())
            .in_transaction("users", Some("7".into()));
        let text = err.to_string();
        assert!(text.contains("users"));
        assert!(text.contains("at key 7"));
    }

    #[test]
    fn test_connectivity_is_not_rewrapped() {
        let err = SyncError::Connectivity("closed".into()).in_transaction("users", None);
        assert!(err.is_run_fatal());
    }
}
