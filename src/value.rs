// ABOUTME: Row model shared by snapshots, providers and the change detector
// ABOUTME: Compound key formation and type-aware value comparison

use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::hash::{Hash, Hasher};

/// One table row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// Compound key built from a row's matchOn values.
///
/// Equality and hashing use a canonical text form of every component, with
/// NULL kept as its own marker. Two NULLs are equal (IS NOT DISTINCT FROM),
/// a NULL never equals a non-null value, and integral numbers compare equal
/// regardless of their JSON representation (`1` and `1.0`). Strings are
/// compared as written, so `"007"` and `"7"` are different keys, and so are
/// `"2.50"` and `2.5` even though [`values_equal`] treats those cells as equal.
/// Key columns should carry the same type on both sides. The original values
/// are kept so statements can bind them with their real types.
#[derive(Debug, Clone)]
pub struct RowKey {
    values: Vec<JsonValue>,
    canonical: Vec<Option<String>>,
}

impl RowKey {
    pub fn new(values: Vec<JsonValue>) -> Self {
        let canonical = values.iter().map(canonical_text).collect();
        Self { values, canonical }
    }

    /// Build the key of `row` from `columns`. Missing columns read as NULL.
    pub fn from_row(row: &Row, columns: &[String]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(JsonValue::Null))
                .collect(),
        )
    }

    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    pub fn has_null(&self) -> bool {
        self.canonical.iter().any(Option::is_none)
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .canonical
            .iter()
            .map(|p| p.as_deref().unwrap_or("<null>"))
            .collect();
        write!(f, "{}", parts.join("|"))
    }
}

impl Serialize for RowKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

/// Canonical text of a value, `None` for NULL.
///
/// Booleans render as `1`/`0` so they line up with engines that store them as
/// integers. Integral floats render without a fraction.
pub fn canonical_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        JsonValue::Number(n) => Some(canonical_number(n)),
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Type-aware equality used when comparing snapshot and target cells.
///
/// - NULL equals only NULL
/// - numbers compare numerically (`1 == 1.0`)
/// - a number and a numeric string compare numerically (`"2.50" == 2.5`)
/// - a boolean and a number compare as `1`/`0`
/// - strings compare exactly, no trimming or case folding
/// - anything else (objects, arrays) compares structurally
pub fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    use JsonValue::*;
    match (a, b) {
        (Null, Null) => true,
        (Null, _) | (_, Null) => false,
        (Number(x), Number(y)) => numbers_equal(x, y),
        (Bool(x), Bool(y)) => x == y,
        (Bool(flag), Number(n)) | (Number(n), Bool(flag)) => {
            n.as_f64() == Some(if *flag { 1.0 } else { 0.0 })
        }
        (Number(n), String(s)) | (String(s), Number(n)) => match s.trim().parse::<f64>() {
            Ok(parsed) => n.as_f64() == Some(parsed),
            Err(_) => false,
        },
        (String(x), String(y)) => x == y,
        _ => a == b,
    }
}

fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Canonical fingerprint of a row over `columns`, used for multiset comparison.
pub fn row_fingerprint(row: &Row, columns: &[String]) -> Vec<Option<String>> {
    columns
        .iter()
        .map(|c| row.get(c).and_then(canonical_text))
        .collect()
}
