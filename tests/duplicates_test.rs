// ABOUTME: Duplicate analysis and resolution against live SQLite tables
// ABOUTME: Group detection, auto-removal keeping the lowest key, export policies, side checks

use table_promoter::provider::{Connection, SqliteConnection, TableName};
use table_promoter::sync::{
    check_duplicates, export_tables, Decision, DuplicateAnalyzer, DuplicateResolver, FixedDecision,
    Resolution, RunOptions, ScriptedDecisions, Side, TableStatus,
};
use table_promoter::{DuplicatePolicy, TableSyncSpec};
use tempfile::TempDir;

fn memory_db(sql: &str) -> SqliteConnection {
    let conn = SqliteConnection::open(":memory:").unwrap();
    conn.execute_batch(sql).unwrap();
    conn
}

fn table(name: &str) -> TableName {
    TableName::parse(name).unwrap()
}

#[tokio::test]
async fn test_shared_email_forms_one_group_of_two() {
    let conn = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (1, 'a@x'), (2, 'b@x'), (3, 'a@x');",
    );
    let check = DuplicateAnalyzer::new(&conn)
        .check(&table("users"), &["email".to_string()], None)
        .await
        .unwrap();

    assert!(!check.is_unique);
    assert_eq!(check.report.groups.len(), 1);
    assert_eq!(check.report.groups[0].rows.len(), 2);
    assert_eq!(check.report.total_duplicate_rows, 2);
    assert_eq!(check.report.groups[0].key.to_string(), "a@x");
}

#[tokio::test]
async fn test_filter_limits_the_check() {
    let conn = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, active INTEGER);
         INSERT INTO users VALUES (1, 'a@x', 1), (2, 'a@x', 0);",
    );
    let check = DuplicateAnalyzer::new(&conn)
        .check(&table("users"), &["email".to_string()], Some("active = 1"))
        .await
        .unwrap();
    assert!(check.is_unique);
}

#[tokio::test]
async fn test_null_keys_are_duplicates_of_each_other() {
    let conn = memory_db(
        "CREATE TABLE codes (id INTEGER PRIMARY KEY, region TEXT, code TEXT);
         INSERT INTO codes VALUES (1, 'eu', NULL), (2, 'eu', NULL), (3, 'us', NULL), (4, 'eu', '');",
    );
    let check = DuplicateAnalyzer::new(&conn)
        .check(&table("codes"), &["region".to_string(), "code".to_string()], None)
        .await
        .unwrap();
    assert_eq!(check.report.groups.len(), 1);
    assert_eq!(check.report.total_duplicate_rows, 2);
}

#[tokio::test]
async fn test_auto_remove_group_of_three_keeps_lowest_key() {
    let conn = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (7, 'a@x'), (3, 'a@x'), (5, 'a@x'), (9, 'z@x');",
    );
    let analyzer = DuplicateAnalyzer::new(&conn);
    let check = analyzer
        .check(&table("users"), &["email".to_string()], None)
        .await
        .unwrap();
    assert_eq!(check.report.groups[0].rows.len(), 3);

    let resolver = DuplicateResolver::new(&conn, table("users"), vec!["email".to_string()]);
    let resolution = resolver
        .resolve(check.report, &mut FixedDecision(Decision::AutoRemove))
        .await
        .unwrap();
    assert!(matches!(resolution, Resolution::Resolved { removed: 2, .. }));

    let after = analyzer
        .check(&table("users"), &["email".to_string()], None)
        .await
        .unwrap();
    assert!(after.is_unique);

    let ids: Vec<i64> = conn
        .query("SELECT id FROM users ORDER BY id", &[])
        .await
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3, 9]);
}

#[tokio::test]
async fn test_auto_remove_without_primary_key_uses_rowid() {
    let conn = memory_db(
        "CREATE TABLE events (kind TEXT, payload TEXT);
         INSERT INTO events VALUES ('a', 'first'), ('a', 'second'), ('b', 'only');",
    );
    let check = DuplicateAnalyzer::new(&conn)
        .check(&table("events"), &["kind".to_string()], None)
        .await
        .unwrap();

    let resolution = DuplicateResolver::new(&conn, table("events"), vec!["kind".to_string()])
        .resolve(check.report, &mut FixedDecision(Decision::AutoRemove))
        .await
        .unwrap();
    assert!(matches!(resolution, Resolution::Resolved { removed: 1, .. }));

    let payloads: Vec<String> = conn
        .query("SELECT payload FROM events ORDER BY rowid", &[])
        .await
        .unwrap()
        .iter()
        .map(|r| r["payload"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(payloads, vec!["first", "only"]);
}

#[tokio::test]
async fn test_list_then_abort_changes_nothing() {
    let conn = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (1, 'a@x'), (2, 'a@x');",
    );
    let check = DuplicateAnalyzer::new(&conn)
        .check(&table("users"), &["email".to_string()], None)
        .await
        .unwrap();

    let mut script = ScriptedDecisions::new([Decision::List, Decision::List, Decision::Abort], Decision::AutoRemove);
    let resolution = DuplicateResolver::new(&conn, table("users"), vec!["email".to_string()])
        .resolve(check.report, &mut script)
        .await
        .unwrap();

    assert!(matches!(resolution, Resolution::Aborted { .. }));
    assert_eq!(script.listed, 2);
    assert_eq!(conn.query("SELECT * FROM users", &[]).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_export_with_auto_remove_cleans_source() {
    let dir = TempDir::new().unwrap();
    let conn = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (1, 'a@x'), (2, 'a@x'), (3, 'b@x');",
    );
    let specs = vec![TableSyncSpec::keyed("users", &["email"]).unwrap()];
    let mut options = RunOptions::new(dir.path());
    options.policy = DuplicatePolicy::AutoRemove;

    let report = export_tables(&conn, &specs, &options, &mut FixedDecision(Decision::AutoRemove)).await;
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, TableStatus::Exported);
    assert_eq!(outcome.row_count, Some(2));
    assert!(outcome.message.as_ref().unwrap().contains("removed from source"));
}

#[tokio::test]
async fn test_export_abort_reports_groups() {
    let dir = TempDir::new().unwrap();
    let conn = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (1, 'a@x'), (2, 'a@x');",
    );
    let specs = vec![TableSyncSpec::keyed("users", &["email"]).unwrap()];
    let report = export_tables(
        &conn,
        &specs,
        &RunOptions::new(dir.path()),
        &mut FixedDecision(Decision::Abort),
    )
    .await;

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, TableStatus::DuplicateBlocked);
    assert_eq!(outcome.duplicates.as_ref().unwrap().groups.len(), 1);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_check_duplicates_on_each_side() {
    let source = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (1, 'a@x'), (2, 'b@x');",
    );
    let target = memory_db(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
         INSERT INTO users VALUES (1, 'a@x'), (2, 'a@x');",
    );
    let specs = vec![TableSyncSpec::keyed("users", &["email"]).unwrap()];

    let report = check_duplicates(&source, &specs, Side::Source).await;
    assert_eq!(report.outcomes[0].status, TableStatus::Unique);

    let report = check_duplicates(&target, &specs, Side::Target).await;
    assert_eq!(report.outcomes[0].status, TableStatus::DuplicateBlocked);

    // Read-only: the target still holds both rows
    assert_eq!(target.query("SELECT * FROM users", &[]).await.unwrap().len(), 2);
}
