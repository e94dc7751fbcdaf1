// ABOUTME: End-to-end promotion tests over temp-file SQLite databases
// ABOUTME: Export, dry run, execute, idempotence, replace mode and failure scoping

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use table_promoter::provider::{Connection, SqliteConnection};
use table_promoter::sync::{
    export_tables, import_tables, Decision, FixedDecision, RunOptions, RunReport, TableStatus,
};
use table_promoter::value::Row;
use table_promoter::{DuplicatePolicy, TableSyncSpec};
use tempfile::TempDir;

/// Create a SQLite database file with the given DDL/DML and open it.
fn create_db(dir: &TempDir, name: &str, sql: &str) -> SqliteConnection {
    let path = dir.path().join(name);
    let raw = rusqlite::Connection::open(&path).expect("create database");
    raw.execute_batch(sql).expect("seed database");
    drop(raw);
    SqliteConnection::open(path.to_str().unwrap()).expect("open database")
}

fn options(dir: &TempDir) -> RunOptions {
    RunOptions::new(dir.path().join("snapshots"))
}

fn executing(dir: &TempDir) -> RunOptions {
    let mut options = options(dir);
    options.execute = true;
    options
}

async fn rows(conn: &SqliteConnection, sql: &str) -> Vec<Row> {
    conn.query(sql, &[]).await.unwrap()
}

fn only(report: &RunReport) -> &table_promoter::sync::TableOutcome {
    assert_eq!(report.outcomes.len(), 1, "{:?}", report.outcomes);
    &report.outcomes[0]
}

fn users_spec() -> TableSyncSpec {
    TableSyncSpec::keyed("Users", &["UserID"])
        .unwrap()
        .with_preserve_identity(true)
}

fn users_source(dir: &TempDir) -> SqliteConnection {
    create_db(
        dir,
        "source.db",
        "CREATE TABLE Users (UserID INTEGER PRIMARY KEY, Email TEXT);
         INSERT INTO Users VALUES (1, 'a@new'), (2, 'b');",
    )
}

fn users_target(dir: &TempDir) -> SqliteConnection {
    create_db(
        dir,
        "target.db",
        "CREATE TABLE Users (UserID INTEGER PRIMARY KEY, Email TEXT);
         INSERT INTO Users VALUES (1, 'a@old');",
    )
}

#[tokio::test]
async fn test_users_example_dry_run_then_execute() {
    let dir = TempDir::new().unwrap();
    let source = users_source(&dir);
    let target = users_target(&dir);
    let specs = vec![users_spec()];
    let mut decisions = FixedDecision(Decision::Abort);

    let exported = export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    assert_eq!(only(&exported).status, TableStatus::Exported);
    assert_eq!(only(&exported).row_count, Some(2));

    // Dry run reports the changes and leaves the target alone
    let dry = import_tables(&target, &specs, &options(&dir), &mut decisions).await;
    let outcome = only(&dry);
    assert_eq!(outcome.status, TableStatus::DryRun);
    let changes = outcome.changes.as_ref().unwrap();
    assert_eq!(changes.inserts.len(), 1);
    assert_eq!(changes.inserts[0]["UserID"], 2);
    assert_eq!(changes.inserts[0]["Email"], "b");
    assert_eq!(changes.updates.len(), 1);
    assert_eq!(changes.updates[0].key.to_string(), "1");
    assert_eq!(changes.updates[0].changed_columns, vec!["Email"]);
    assert!(changes.deletes.is_empty());
    assert_eq!(rows(&target, "SELECT * FROM Users").await.len(), 1);

    let applied = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    let outcome = only(&applied);
    assert_eq!(outcome.status, TableStatus::ChangesApplied);
    let apply = outcome.apply.as_ref().unwrap();
    assert_eq!((apply.insert_count, apply.update_count, apply.delete_count), (1, 1, 0));
    assert_eq!(applied.exit_code(), 0);

    let after = rows(&target, "SELECT UserID, Email FROM Users ORDER BY UserID").await;
    let source_rows = rows(&source, "SELECT UserID, Email FROM Users ORDER BY UserID").await;
    assert_eq!(after, source_rows);

    // Detecting again after applying finds nothing
    let again = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    assert_eq!(only(&again).status, TableStatus::NoChanges);
}

#[tokio::test]
async fn test_default_config_keeps_primary_key_and_stays_idempotent() {
    let dir = TempDir::new().unwrap();
    let source = create_db(
        &dir,
        "source.db",
        "CREATE TABLE Users (UserID INTEGER PRIMARY KEY, Email TEXT);
         INSERT INTO Users VALUES (1, 'a'), (5, 'b');",
    );
    let target = create_db(
        &dir,
        "target.db",
        "CREATE TABLE Users (UserID INTEGER PRIMARY KEY, Email TEXT);
         INSERT INTO Users VALUES (1, 'a');",
    );
    // Match on the primary key without preserving identity values
    let specs = vec![TableSyncSpec::keyed("Users", &[]).unwrap()];
    let mut decisions = FixedDecision(Decision::Abort);

    let exported = export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    assert_eq!(only(&exported).status, TableStatus::Exported);

    let first = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    let outcome = only(&first);
    assert_eq!(outcome.status, TableStatus::ChangesApplied);
    let apply = outcome.apply.as_ref().unwrap();
    assert_eq!((apply.insert_count, apply.update_count, apply.delete_count), (1, 0, 0));

    for _ in 0..2 {
        let again = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
        assert_eq!(only(&again).status, TableStatus::NoChanges);
    }

    let after = rows(&target, "SELECT UserID, Email FROM Users ORDER BY UserID").await;
    let source_rows = rows(&source, "SELECT UserID, Email FROM Users ORDER BY UserID").await;
    assert_eq!(after, source_rows);
}

#[tokio::test]
async fn test_ignored_column_produces_no_update() {
    let dir = TempDir::new().unwrap();
    let source = users_source(&dir);
    let target = users_target(&dir);
    let specs = vec![users_spec().with_ignore_columns(&["Email"])];
    let mut decisions = FixedDecision(Decision::Abort);

    export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    let report = import_tables(&target, &specs, &options(&dir), &mut decisions).await;
    let changes = only(&report).changes.as_ref().unwrap();
    assert_eq!(changes.inserts.len(), 1);
    assert!(changes.updates.is_empty());
}

#[tokio::test]
async fn test_identical_tables_have_no_changes() {
    let dir = TempDir::new().unwrap();
    let ddl = "CREATE TABLE items (sku TEXT PRIMARY KEY, price REAL, qty INTEGER, note TEXT);
               INSERT INTO items VALUES ('A-1', 2.5, 3, NULL), ('B-2', 10, 0, '');";
    let source = create_db(&dir, "source.db", ddl);
    let target = create_db(&dir, "target.db", ddl);
    let specs = vec![TableSyncSpec::keyed("items", &[])
        .unwrap()
        .with_allow(true, true, true)];
    let mut decisions = FixedDecision(Decision::Abort);

    export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    let report = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    assert_eq!(only(&report).status, TableStatus::NoChanges);
}

#[tokio::test]
async fn test_deletes_follow_allow_deletes() {
    let dir = TempDir::new().unwrap();
    let source = create_db(
        &dir,
        "source.db",
        "CREATE TABLE tags (name TEXT PRIMARY KEY, color TEXT);
         INSERT INTO tags VALUES ('red', '#f00');",
    );
    let target = create_db(
        &dir,
        "target.db",
        "CREATE TABLE tags (name TEXT PRIMARY KEY, color TEXT);
         INSERT INTO tags VALUES ('red', '#f00'), ('stale', '#000');",
    );
    let mut decisions = FixedDecision(Decision::Abort);

    let keep = vec![TableSyncSpec::keyed("tags", &["name"]).unwrap()];
    export_tables(&source, &keep, &options(&dir), &mut decisions).await;
    let report = import_tables(&target, &keep, &executing(&dir), &mut decisions).await;
    assert_eq!(only(&report).status, TableStatus::NoChanges);

    let prune = vec![TableSyncSpec::keyed("tags", &["name"])
        .unwrap()
        .with_allow(true, true, true)];
    export_tables(&source, &prune, &options(&dir), &mut decisions).await;
    let report = import_tables(&target, &prune, &executing(&dir), &mut decisions).await;
    assert_eq!(only(&report).apply.as_ref().unwrap().delete_count, 1);
    assert_eq!(rows(&target, "SELECT * FROM tags").await.len(), 1);
}

#[tokio::test]
async fn test_replace_mode_reaches_fixed_point() {
    let dir = TempDir::new().unwrap();
    let source = create_db(
        &dir,
        "source.db",
        "CREATE TABLE countries (code TEXT, name TEXT);
         INSERT INTO countries VALUES ('DE', 'Germany'), ('FR', 'France'), ('FR', 'France');",
    );
    let target = create_db(
        &dir,
        "target.db",
        "CREATE TABLE countries (code TEXT, name TEXT);
         INSERT INTO countries VALUES ('XX', 'Nowhere');",
    );
    let specs = vec![TableSyncSpec::replace("countries").unwrap()];
    let mut decisions = FixedDecision(Decision::Abort);

    let exported = export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    assert_eq!(only(&exported).status, TableStatus::Exported);

    let first = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    let apply = only(&first).apply.as_ref().unwrap();
    assert_eq!((apply.insert_count, apply.delete_count), (3, 1));

    let second = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    let outcome = only(&second);
    assert_eq!(outcome.status, TableStatus::NoChanges);
    let apply = outcome.apply.as_ref().unwrap();
    assert_eq!((apply.insert_count, apply.delete_count), (0, 0));
}

#[tokio::test]
async fn test_replace_mode_fixed_point_with_generated_ids() {
    let dir = TempDir::new().unwrap();
    let source = create_db(
        &dir,
        "source.db",
        "CREATE TABLE c (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO c VALUES (10, 'a'), (20, 'b');",
    );
    let target = create_db(
        &dir,
        "target.db",
        "CREATE TABLE c (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO c VALUES (1, 'old');",
    );
    let specs = vec![TableSyncSpec::replace("c").unwrap()];
    let mut decisions = FixedDecision(Decision::Abort);

    export_tables(&source, &specs, &options(&dir), &mut decisions).await;

    let first = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    assert_eq!(only(&first).status, TableStatus::ChangesApplied);
    let names = rows(&target, "SELECT name FROM c ORDER BY name").await;
    assert_eq!(names.len(), 2);
    assert_eq!(names[0]["name"], "a");
    assert_eq!(names[1]["name"], "b");

    // The target numbered the rows itself; that alone is not a difference
    let second = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    let outcome = only(&second);
    assert_eq!(outcome.status, TableStatus::NoChanges);
    let apply = outcome.apply.as_ref().unwrap();
    assert_eq!((apply.insert_count, apply.delete_count), (0, 0));
}

#[tokio::test]
async fn test_failures_are_scoped_to_one_table() {
    let dir = TempDir::new().unwrap();
    let source = users_source(&dir);
    let target = users_target(&dir);
    let mut decisions = FixedDecision(Decision::Abort);

    let specs = vec![
        TableSyncSpec::keyed("Missing", &["id"]).unwrap(),
        users_spec(),
    ];
    let exported = export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    assert_eq!(exported.outcomes[0].status, TableStatus::ValidationFailed);
    assert_eq!(exported.outcomes[1].status, TableStatus::Exported);
    assert_eq!(exported.exit_code(), 1);

    // No snapshot for the first table, the second still imports
    let imported = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    assert_eq!(imported.outcomes[0].status, TableStatus::ValidationFailed);
    assert_eq!(imported.outcomes[1].status, TableStatus::ChangesApplied);
    assert!(imported.fatal.is_none());
}

#[tokio::test]
async fn test_missing_target_column_fails_validation() {
    let dir = TempDir::new().unwrap();
    let source = users_source(&dir);
    let target = create_db(&dir, "target.db", "CREATE TABLE Users (UserID INTEGER PRIMARY KEY);");
    let specs = vec![users_spec()];
    let mut decisions = FixedDecision(Decision::Abort);

    export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    let report = import_tables(&target, &specs, &options(&dir), &mut decisions).await;
    let outcome = only(&report);
    assert_eq!(outcome.status, TableStatus::ValidationFailed);
    assert!(outcome.message.as_ref().unwrap().contains("Email"));
}

#[tokio::test]
async fn test_transaction_failure_rolls_back() {
    let dir = TempDir::new().unwrap();
    let source = create_db(
        &dir,
        "source.db",
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, handle TEXT);
         INSERT INTO accounts VALUES (1, 'one-renamed'), (2, 'taken');",
    );
    let target = create_db(
        &dir,
        "target.db",
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, handle TEXT UNIQUE);
         INSERT INTO accounts VALUES (1, 'one'), (3, 'taken');",
    );
    let specs = vec![TableSyncSpec::keyed("accounts", &["id"])
        .unwrap()
        .with_preserve_identity(true)];
    let mut decisions = FixedDecision(Decision::Abort);

    export_tables(&source, &specs, &options(&dir), &mut decisions).await;
    let report = import_tables(&target, &specs, &executing(&dir), &mut decisions).await;
    let outcome = only(&report);
    assert_eq!(outcome.status, TableStatus::TransactionFailed);
    assert_eq!(report.exit_code(), 1);

    let handles: Vec<String> = rows(&target, "SELECT handle FROM accounts ORDER BY id")
        .await
        .iter()
        .map(|r| r["handle"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(handles, vec!["one", "taken"]);
}

#[tokio::test]
async fn test_cancelled_run_does_nothing() {
    let dir = TempDir::new().unwrap();
    let source = users_source(&dir);
    let specs = vec![users_spec()];
    let mut options = options(&dir);
    options.cancel = Some(Arc::new(AtomicBool::new(true)));

    let report = export_tables(&source, &specs, &options, &mut FixedDecision(Decision::Abort)).await;
    assert!(report.cancelled);
    assert_eq!(only(&report).status, TableStatus::NotRun);
    assert!(!dir.path().join("snapshots/Users.json").exists());
}

#[tokio::test]
async fn test_target_duplicates_block_until_resolved() {
    let dir = TempDir::new().unwrap();
    let source = create_db(
        &dir,
        "source.db",
        "CREATE TABLE people (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
         INSERT INTO people VALUES (10, 'a@x', 'Ann'), (11, 'c@x', 'Cy');",
    );
    let target = create_db(
        &dir,
        "target.db",
        "CREATE TABLE people (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
         INSERT INTO people VALUES (1, 'a@x', 'old'), (2, 'a@x', 'older');",
    );
    let specs = vec![TableSyncSpec::keyed("people", &["email"])
        .unwrap()
        .with_ignore_columns(&["id"])];
    let mut decisions = FixedDecision(Decision::AutoRemove);

    export_tables(&source, &specs, &options(&dir), &mut decisions).await;

    let blocked = import_tables(&target, &specs, &options(&dir), &mut decisions).await;
    let outcome = only(&blocked);
    assert_eq!(outcome.status, TableStatus::DuplicateBlocked);
    assert_eq!(outcome.duplicates.as_ref().unwrap().total_duplicate_rows, 2);

    let mut resolving = executing(&dir);
    resolving.policy = DuplicatePolicy::AutoRemove;
    let report = import_tables(&target, &specs, &resolving, &mut decisions).await;
    assert_eq!(only(&report).status, TableStatus::ChangesApplied);

    let after = rows(&target, "SELECT id, email, name FROM people ORDER BY email").await;
    assert_eq!(after.len(), 2);
    assert_eq!(after[0]["id"], 1);
    assert_eq!(after[0]["name"], "Ann");
    assert_eq!(after[1]["email"], "c@x");
}
