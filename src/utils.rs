// ABOUTME: Small helpers for identifier quoting, URL masking and snapshot file names
// ABOUTME: Shared by providers, SQL builders and the snapshot store

/// Quote an SQL identifier (schema, table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes. Both
/// PostgreSQL and SQLite accept this form.
///
/// # Examples
///
/// ```
/// # use table_promoter::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Sanitize a database URL by masking the password component
///
/// Non-URL inputs (SQLite file paths) are returned unchanged.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}

/// File name for a table's snapshot
///
/// Keeps letters, digits, `.`, `-` and `_`; everything else becomes `_`.
pub fn snapshot_file_name(table: &str) -> String {
    let stem: String = table
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.json", stem)
}
