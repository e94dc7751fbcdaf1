// ABOUTME: TOML configuration for promotion runs and per-table sync specs
// ABOUTME: Resolves raw table flags once into the KeyedSync/ReplaceSync tagged union

use crate::error::{SyncError, SyncResult};
use crate::provider::TableName;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// What to do when a key turns out not to be unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Fail the table.
    #[default]
    Abort,
    /// Leave the table out of this run.
    Skip,
    /// Export only the first row of each group (lowest primary key). Export only.
    KeepFirst,
    /// Delete all but the lowest-key row of each group, then re-check.
    AutoRemove,
    /// Ask on the terminal; falls back to abort when not interactive.
    Prompt,
}

/// Where to find one database.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Literal connection URL or SQLite path.
    pub url: Option<String>,
    /// Name of an environment variable holding the URL.
    pub url_env: Option<String>,
    /// Accept self-signed TLS certificates (PostgreSQL only).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl ConnectionConfig {
    pub fn resolve_url(&self, label: &str) -> Result<String> {
        match (&self.url, &self.url_env) {
            (Some(url), None) => Ok(url.clone()),
            (None, Some(var)) => std::env::var(var)
                .with_context(|| format!("Environment variable {} for {} is not set", var, label)),
            (Some(_), Some(_)) => bail!("{}: set either 'url' or 'url_env', not both", label),
            (None, None) => bail!("{}: no connection configured ('url' or 'url_env')", label),
        }
    }
}

/// One `[[tables]]` entry as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub source_table: String,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub match_on: Vec<String>,
    #[serde(default)]
    pub ignore_columns: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_inserts: bool,
    #[serde(default = "default_true")]
    pub allow_updates: bool,
    #[serde(default)]
    pub allow_deletes: bool,
    #[serde(default)]
    pub preserve_identity: bool,
    #[serde(default)]
    pub export_where: Option<String>,
    #[serde(default)]
    pub replace_mode: bool,
}

fn default_true() -> bool {
    true
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

/// Key-based diffing behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedSync {
    /// Empty until resolved to the primary key at export time.
    pub match_on: Vec<String>,
    pub ignore_columns: Vec<String>,
    pub allow_inserts: bool,
    pub allow_updates: bool,
    pub allow_deletes: bool,
    pub preserve_identity: bool,
}

/// Delete-everything-then-reload behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceSync {
    pub preserve_identity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    Keyed(KeyedSync),
    Replace(ReplaceSync),
}

/// A validated table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSyncSpec {
    pub source_table: TableName,
    pub target_table: TableName,
    pub export_where: Option<String>,
    pub mode: SyncMode,
}

impl TableSyncSpec {
    /// Keyed spec with inserts and updates allowed, deletes off.
    pub fn keyed(source_table: &str, match_on: &[&str]) -> SyncResult<Self> {
        TableConfig {
            source_table: source_table.to_string(),
            target_table: None,
            match_on: match_on.iter().map(|c| c.to_string()).collect(),
            ignore_columns: Vec::new(),
            allow_inserts: true,
            allow_updates: true,
            allow_deletes: false,
            preserve_identity: false,
            export_where: None,
            replace_mode: false,
        }
        .resolve()
    }

    /// Replace-mode spec.
    pub fn replace(source_table: &str) -> SyncResult<Self> {
        Ok(Self {
            source_table: TableName::parse(source_table)?,
            target_table: TableName::parse(source_table)?,
            export_where: None,
            mode: SyncMode::Replace(ReplaceSync {
                preserve_identity: false,
            }),
        })
    }

    pub fn label(&self) -> String {
        self.source_table.to_string()
    }

    /// Configured key columns; always empty in replace mode.
    pub fn match_on(&self) -> &[String] {
        match &self.mode {
            SyncMode::Keyed(k) => &k.match_on,
            SyncMode::Replace(_) => &[],
        }
    }

    pub fn ignore_columns(&self) -> &[String] {
        match &self.mode {
            SyncMode::Keyed(k) => &k.ignore_columns,
            SyncMode::Replace(_) => &[],
        }
    }

    pub fn preserve_identity(&self) -> bool {
        match &self.mode {
            SyncMode::Keyed(k) => k.preserve_identity,
            SyncMode::Replace(r) => r.preserve_identity,
        }
    }

    pub fn is_replace(&self) -> bool {
        matches!(self.mode, SyncMode::Replace(_))
    }

    pub fn with_target(mut self, target_table: &str) -> SyncResult<Self> {
        self.target_table = TableName::parse(target_table)?;
        Ok(self)
    }

    pub fn with_ignore_columns(mut self, columns: &[&str]) -> Self {
        if let SyncMode::Keyed(k) = &mut self.mode {
            k.ignore_columns = columns.iter().map(|c| c.to_string()).collect();
        }
        self
    }

    pub fn with_allow(mut self, inserts: bool, updates: bool, deletes: bool) -> Self {
        if let SyncMode::Keyed(k) = &mut self.mode {
            k.allow_inserts = inserts;
            k.allow_updates = updates;
            k.allow_deletes = deletes;
        }
        self
    }

    pub fn with_preserve_identity(mut self, preserve: bool) -> Self {
        match &mut self.mode {
            SyncMode::Keyed(k) => k.preserve_identity = preserve,
            SyncMode::Replace(r) => r.preserve_identity = preserve,
        }
        self
    }

    pub fn with_export_where(mut self, predicate: &str) -> Self {
        self.export_where = Some(predicate.to_string());
        self
    }
}

impl TableConfig {
    /// Validate the raw entry and fold its flags into a [`SyncMode`].
    pub fn resolve(&self) -> SyncResult<TableSyncSpec> {
        let source_table = TableName::parse(&self.source_table)?;
        let target_table = match &self.target_table {
            Some(t) => TableName::parse(t)?,
            None => source_table.clone(),
        };
        let label = source_table.to_string();

        let export_where = self
            .export_where
            .as_ref()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty());

        if self.replace_mode {
            if !self.match_on.is_empty() || !self.ignore_columns.is_empty() {
                tracing::warn!(
                    "{}: replace_mode ignores match_on and ignore_columns",
                    label
                );
            }
            return Ok(TableSyncSpec {
                source_table,
                target_table,
                export_where,
                mode: SyncMode::Replace(ReplaceSync {
                    preserve_identity: self.preserve_identity,
                }),
            });
        }

        check_column_list(&label, "match_on", &self.match_on)?;
        check_column_list(&label, "ignore_columns", &self.ignore_columns)?;
        if let Some(both) = self
            .match_on
            .iter()
            .find(|c| self.ignore_columns.contains(c))
        {
            return Err(SyncError::validation(
                &label,
                format!("column '{}' is both a match_on key and ignored", both),
            ));
        }

        Ok(TableSyncSpec {
            source_table,
            target_table,
            export_where,
            mode: SyncMode::Keyed(KeyedSync {
                match_on: self.match_on.clone(),
                ignore_columns: self.ignore_columns.clone(),
                allow_inserts: self.allow_inserts,
                allow_updates: self.allow_updates,
                allow_deletes: self.allow_deletes,
                preserve_identity: self.preserve_identity,
            }),
        })
    }
}

fn check_column_list(table: &str, field: &str, columns: &[String]) -> SyncResult<()> {
    let mut seen = HashSet::new();
    for column in columns {
        if column.trim().is_empty() {
            return Err(SyncError::validation(table, format!("{} contains an empty column name", field)));
        }
        if !seen.insert(column.as_str()) {
            return Err(SyncError::validation(
                table,
                format!("{} lists column '{}' more than once", field, column),
            ));
        }
    }
    Ok(())
}

/// Whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default)]
    pub on_duplicates: DuplicatePolicy,
    /// Upper bound on resolver rounds before it gives up and aborts.
    #[serde(default = "default_resolve_rounds")]
    pub max_resolve_rounds: usize,
    pub source: Option<ConnectionConfig>,
    pub target: Option<ConnectionConfig>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

fn default_resolve_rounds() -> usize {
    5
}

impl SyncConfig {
    /// Load a config file. A relative `snapshot_dir` is taken relative to
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        if config.snapshot_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.snapshot_dir = parent.join(&config.snapshot_dir);
            }
        }

        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents)?;
        if config.tables.is_empty() {
            bail!("Config declares no [[tables]]");
        }
        if config.max_resolve_rounds == 0 {
            bail!("max_resolve_rounds must be at least 1");
        }
        Ok(config)
    }

    /// Resolve every table entry, keeping configuration order.
    ///
    /// `only` restricts the result to the named source tables; naming a table
    /// that is not configured is an error rather than a silent no-op.
    pub fn table_specs(&self, only: Option<&[String]>) -> Result<Vec<TableSyncSpec>> {
        let mut specs = Vec::with_capacity(self.tables.len());
        let mut seen = HashSet::new();

        for table in &self.tables {
            let spec = table.resolve()?;
            if !seen.insert(spec.label()) {
                bail!("Table {} is configured more than once", spec.label());
            }
            specs.push(spec);
        }

        if let Some(only) = only {
            for name in only {
                if !seen.contains(name) {
                    bail!("Table '{}' is not in the config file", name);
                }
            }
            specs.retain(|s| only.contains(&s.label()));
        }

        Ok(specs)
    }
}
