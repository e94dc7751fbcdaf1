// ABOUTME: Console rendering of run reports, duplicate groups and snapshot metadata
// ABOUTME: Plain-text summary tables printed to stdout after each command

use crate::sync::{DuplicateReport, RunReport, SnapshotMetadata, TableOutcome, TableStatus};

/// Groups and rows shown per duplicate report before truncating.
const MAX_GROUPS_SHOWN: usize = 10;
const MAX_ROWS_SHOWN: usize = 5;

fn icon(status: TableStatus) -> &'static str {
    match status {
        TableStatus::Exported
        | TableStatus::Unique
        | TableStatus::NoChanges
        | TableStatus::ChangesApplied => "✓",
        TableStatus::DryRun => "•",
        TableStatus::Skipped | TableStatus::NotRun => "-",
        TableStatus::ValidationFailed | TableStatus::DuplicateBlocked | TableStatus::TransactionFailed => "✗",
    }
}

/// Render the per-table lines of a run with a closing verdict.
pub fn render_run(title: &str, report: &RunReport) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(title);
    out.push('\n');
    out.push_str(&"═".repeat(61));
    out.push_str("\n\n");

    for outcome in &report.outcomes {
        out.push_str(&render_outcome(outcome));
    }

    out.push('\n');
    out.push_str(&"═".repeat(61));
    out.push('\n');

    let failed = report.outcomes.iter().filter(|o| o.status.is_failure()).count();
    if let Some(fatal) = &report.fatal {
        out.push_str(&format!("ABORTED: {}\n", fatal));
    } else if report.cancelled {
        out.push_str("CANCELLED: remaining tables were not processed\n");
    } else if failed == 0 {
        out.push_str(&format!("PASSED: {} table(s) processed\n", report.outcomes.len()));
    } else {
        out.push_str(&format!(
            "FAILED: {} of {} table(s) need attention\n",
            failed,
            report.outcomes.len()
        ));
    }
    out
}

fn render_outcome(outcome: &TableOutcome) -> String {
    let mut out = format!("  {} {:<40} {:?}\n", icon(outcome.status), outcome.table, outcome.status);

    if let Some(apply) = &outcome.apply {
        if outcome.status == TableStatus::ChangesApplied || outcome.status == TableStatus::DryRun {
            out.push_str(&format!(
                "      inserts: {}, updates: {}, deletes: {}\n",
                apply.insert_count, apply.update_count, apply.delete_count
            ));
        }
    } else if let Some(rows) = outcome.row_count {
        out.push_str(&format!("      {} row(s)", rows));
        if let Some(path) = &outcome.snapshot_path {
            out.push_str(&format!(" → {}", path.display()));
        }
        out.push('\n');
    }

    if let Some(message) = &outcome.message {
        if outcome.status != TableStatus::ChangesApplied && outcome.status != TableStatus::DryRun {
            out.push_str(&format!("      {}\n", message));
        }
    }
    if let Some(duplicates) = &outcome.duplicates {
        out.push_str(&render_duplicates(duplicates));
    }
    out
}

/// Render duplicate groups, truncated for large reports.
pub fn render_duplicates(report: &DuplicateReport) -> String {
    let mut out = format!(
        "      {} group(s) on ({}), {} row(s) involved\n",
        report.groups.len(),
        report.match_on.join(", "),
        report.total_duplicate_rows
    );

    for group in report.groups.iter().take(MAX_GROUPS_SHOWN) {
        out.push_str(&format!("      • {} ({} rows)\n", group.key, group.rows.len()));
        for row in group.rows.iter().take(MAX_ROWS_SHOWN) {
            let text = serde_json::to_string(row).unwrap_or_default();
            out.push_str(&format!("          {}\n", text));
        }
        if group.rows.len() > MAX_ROWS_SHOWN {
            out.push_str(&format!("          … {} more\n", group.rows.len() - MAX_ROWS_SHOWN));
        }
    }
    if report.groups.len() > MAX_GROUPS_SHOWN {
        out.push_str(&format!(
            "      … {} more group(s)\n",
            report.groups.len() - MAX_GROUPS_SHOWN
        ));
    }
    out
}

pub fn render_snapshot_metadata(meta: &SnapshotMetadata) -> String {
    let mut out = String::new();
    out.push_str(&format!("Snapshot of {} → {}\n", meta.source_table, meta.target_table));
    out.push_str(&"═".repeat(61));
    out.push('\n');
    out.push_str(&format!("  Schema version:    {}\n", meta.schema_version));
    out.push_str(&format!("  Exported at:       {}\n", meta.export_date.to_rfc3339()));
    out.push_str(&format!("  Rows:              {}\n", meta.row_count));
    if meta.replace_mode {
        out.push_str("  Mode:              replace\n");
    } else {
        out.push_str(&format!("  Match on:          {}\n", meta.match_on.join(", ")));
        if !meta.ignore_columns.is_empty() {
            out.push_str(&format!("  Ignored columns:   {}\n", meta.ignore_columns.join(", ")));
        }
        out.push_str(&format!(
            "  Allowed:           inserts={} updates={} deletes={}\n",
            meta.allow_inserts, meta.allow_updates, meta.allow_deletes
        ));
    }
    out.push_str(&format!("  Preserve identity: {}\n", meta.preserve_identity));
    if let Some(filter) = &meta.export_where {
        out.push_str(&format!("  Export filter:     {}\n", filter));
    }
    out.push_str("  Columns:\n");
    for column in &meta.columns {
        let mut flags = Vec::new();
        if column.is_primary_key {
            flags.push("pk");
        }
        if column.is_identity {
            flags.push("identity");
        }
        if !column.nullable {
            flags.push("not null");
        }
        out.push_str(&format!("    {:<30} {}", column.name, column.data_type));
        if !flags.is_empty() {
            out.push_str(&format!(" [{}]", flags.join(", ")));
        }
        out.push('\n');
    }
    out
}

pub fn print_run(title: &str, report: &RunReport) {
    print!("{}", render_run(title, report));
}

pub fn print_duplicates(report: &DuplicateReport) {
    println!();
    println!("Duplicate keys in {}", report.table);
    print!("{}", render_duplicates(report));
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::find_duplicates;
    use serde_json::json;

    #[test]
    fn test_render_run_verdicts() {
        let mut report = RunReport::default();
        report.outcomes.push(TableOutcome::new("users", TableStatus::NoChanges));
        assert!(render_run("Import", &report).contains("PASSED: 1 table(s)"));

        report
            .outcomes
            .push(TableOutcome::new("orders", TableStatus::ValidationFailed).with_message("no such column"));
        let text = render_run("Import", &report);
        assert!(text.contains("FAILED: 1 of 2"));
        assert!(text.contains("✗ orders"));
        assert!(text.contains("no such column"));
    }

    #[test]
    fn test_render_duplicates_truncates() {
        let rows: Vec<_> = (0..30)
            .map(|i| json!({"id": i, "k": i % 12}).as_object().cloned().unwrap())
            .collect();
        let report = find_duplicates("t", &rows, &["k".to_string()]);
        let text = render_duplicates(&report);
        assert!(text.contains("12 group(s) on (k)"));
        assert!(text.contains("… 2 more group(s)"));
    }
}
