// ABOUTME: Tests for the table-promoter binary: commands, confirmation and exit codes
// ABOUTME: Drives export/import/duplicates/inspect over temp-file SQLite databases

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::{tempdir, TempDir};

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_table-promoter"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn create_db(path: &Path, sql: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(sql).unwrap();
}

/// Source/target pair plus a config promoting `users` by email.
fn workspace() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source.db");
    let target = dir.path().join("target.db");
    create_db(
        &source,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
         INSERT INTO users VALUES (1, 'a@x', 'Ann'), (2, 'b@x', 'Bob');",
    );
    create_db(
        &target,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, name TEXT);
         INSERT INTO users VALUES (1, 'a@x', 'Annie');",
    );

    let config = dir.path().join("promote.toml");
    std::fs::write(
        &config,
        format!(
            r#"
snapshot_dir = "snapshots"

[source]
url = "sqlite:{}"

[target]
url = "sqlite:{}"

[[tables]]
source_table = "users"
match_on = ["email"]
ignore_columns = ["id"]
"#,
            source.display(),
            target.display()
        ),
    )
    .unwrap();
    (dir, config)
}

fn run(args: &[&str], config: &Path) -> Output {
    let output = bin()
        .args(args)
        .arg("--config")
        .arg(config)
        .output()
        .expect("Failed to execute command");
    println!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    println!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    output
}

fn target_names(dir: &TempDir) -> Vec<String> {
    let conn = rusqlite::Connection::open(dir.path().join("target.db")).unwrap();
    let mut stmt = conn.prepare("SELECT name FROM users ORDER BY email").unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn test_export_then_import_dry_run_and_execute() {
    let (dir, config) = workspace();

    let output = run(&["export"], &config);
    assert_eq!(output.status.code(), Some(0));
    assert!(dir.path().join("snapshots/users.json").exists());

    let output = run(&["import"], &config);
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("DryRun"));
    assert_eq!(target_names(&dir), vec!["Annie"]);

    let output = run(&["import", "--execute", "--yes"], &config);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(target_names(&dir), vec!["Ann", "Bob"]);

    let output = run(&["import", "--execute", "--yes"], &config);
    assert!(String::from_utf8_lossy(&output.stdout).contains("NoChanges"));
}

#[test]
fn test_execute_without_terminal_requires_yes() {
    let (dir, config) = workspace();
    run(&["export"], &config);

    let output = run(&["import", "--execute"], &config);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--yes"));
    assert_eq!(target_names(&dir), vec!["Annie"]);
}

#[test]
fn test_duplicates_exit_code_and_report() {
    let (dir, config) = workspace();
    create_db(
        &dir.path().join("source.db"),
        "INSERT INTO users VALUES (3, 'a@x', 'Again');",
    );

    let output = run(&["duplicates", "--side", "source"], &config);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DuplicateBlocked"));
    assert!(stdout.contains("a@x"));

    let output = run(&["duplicates", "--side", "target"], &config);
    assert_eq!(output.status.code(), Some(0));

    // Default policy aborts the export
    let output = run(&["export"], &config);
    assert_eq!(output.status.code(), Some(1));

    let output = run(&["export", "--on-duplicates", "keep-first"], &config);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn test_inspect_prints_metadata() {
    let (dir, config) = workspace();
    run(&["export"], &config);

    let output = bin()
        .arg("inspect")
        .arg("--snapshot")
        .arg(dir.path().join("snapshots/users.json"))
        .output()
        .expect("Failed to execute command");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Snapshot of users"));
    assert!(stdout.contains("Match on:          email"));
    assert!(stdout.contains("Rows:              2"));
}

#[test]
fn test_unreachable_database_is_fatal() {
    let (dir, config) = workspace();
    std::fs::remove_file(dir.path().join("source.db")).unwrap();

    let output = run(&["export"], &config);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_unknown_table_filter_is_rejected() {
    let (_dir, config) = workspace();
    let output = run(&["export", "--tables", "nope"], &config);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));
}
