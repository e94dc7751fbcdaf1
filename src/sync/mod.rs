// ABOUTME: Snapshot-based table synchronization engine
// ABOUTME: Export with duplicate guard, key-based change detection, transactional apply

pub mod applier;
pub mod detector;
pub mod duplicates;
pub mod export;
pub mod resolver;
pub mod runner;
pub mod snapshot;
pub mod sql;

pub use applier::{ApplyResult, ChangeApplier};
pub use detector::{diff_rows, replace_rows, ChangeDetector, ChangeSet, DiffRules, RowUpdate};
pub use duplicates::{find_duplicates, DuplicateAnalyzer, DuplicateCheck, DuplicateGroup, DuplicateReport};
pub use export::{ExportOutcome, SnapshotExporter};
pub use resolver::{
    Decision, DecisionSource, DuplicateResolver, FixedDecision, Resolution, ResolverState,
    ScriptedDecisions,
};
pub use runner::{
    check_duplicates, export_tables, import_tables, RunOptions, RunReport, Side, TableOutcome,
    TableStatus,
};
pub use snapshot::{Snapshot, SnapshotMetadata, SNAPSHOT_SCHEMA_VERSION};
