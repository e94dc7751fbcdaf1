// ABOUTME: Versioned snapshot artifact - one JSON file per exported table
// ABOUTME: Atomic writes via temp file + rename, checksum and row count verified on load

use crate::config::TableSyncSpec;
use crate::error::{SyncError, SyncResult};
use crate::provider::ColumnMetadata;
use crate::utils::snapshot_file_name;
use crate::value::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Highest snapshot format this build reads and the one it writes.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Everything about a snapshot except the rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Zero when the field is absent, which is rejected on load.
    #[serde(default)]
    pub schema_version: u32,
    pub source_table: String,
    pub target_table: String,
    pub export_date: DateTime<Utc>,
    pub row_count: usize,
    pub match_on: Vec<String>,
    #[serde(default)]
    pub ignore_columns: Vec<String>,
    pub allow_inserts: bool,
    pub allow_updates: bool,
    pub allow_deletes: bool,
    pub preserve_identity: bool,
    pub replace_mode: bool,
    #[serde(default)]
    pub export_where: Option<String>,
    pub columns: Vec<ColumnMetadata>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Immutable capture of one source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<Row>,
}

impl Snapshot {
    /// Build a snapshot of `rows` as exported under `spec`.
    ///
    /// `match_on` is the resolved key (the primary key when the table entry left it
    /// empty); it is empty for replace-mode tables.
    pub fn capture(
        spec: &TableSyncSpec,
        match_on: Vec<String>,
        columns: Vec<ColumnMetadata>,
        data: Vec<Row>,
    ) -> Self {
        let (allow_inserts, allow_updates, allow_deletes) = match &spec.mode {
            crate::config::SyncMode::Keyed(k) => (k.allow_inserts, k.allow_updates, k.allow_deletes),
            crate::config::SyncMode::Replace(_) => (true, false, true),
        };

        let metadata = SnapshotMetadata {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            source_table: spec.source_table.to_string(),
            target_table: spec.target_table.to_string(),
            export_date: Utc::now(),
            row_count: data.len(),
            match_on,
            ignore_columns: spec.ignore_columns().to_vec(),
            allow_inserts,
            allow_updates,
            allow_deletes,
            preserve_identity: spec.preserve_identity(),
            replace_mode: spec.is_replace(),
            export_where: spec.export_where.clone(),
            columns,
            checksum: Some(checksum_of(&data)),
        };

        Self { metadata, data }
    }

    /// Snapshot file location for a table label inside `dir`.
    pub fn path_for(dir: &Path, table: &str) -> PathBuf {
        dir.join(snapshot_file_name(table))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.metadata.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Write the snapshot into `dir`, replacing any previous one for the table.
    ///
    /// The file is written to a temporary sibling and renamed into place, so
    /// a crash mid-write never leaves a truncated snapshot behind.
    pub fn save(&self, dir: &Path) -> SyncResult<PathBuf> {
        let path = Self::path_for(dir, &self.metadata.source_table);

        std::fs::create_dir_all(dir)
            .map_err(|e| SyncError::snapshot(dir, format!("failed to create directory: {}", e)))?;

        let contents = serde_json::to_vec_pretty(self)
            .map_err(|e| SyncError::snapshot(&path, format!("failed to serialize: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| SyncError::snapshot(&path, format!("failed to create temp file: {}", e)))?;
        tmp.write_all(&contents)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| SyncError::snapshot(&path, format!("failed to write: {}", e)))?;
        tmp.persist(&path)
            .map_err(|e| SyncError::snapshot(&path, format!("failed to move into place: {}", e.error)))?;

        tracing::debug!("Wrote snapshot {:?} ({} rows)", path, self.metadata.row_count);
        Ok(path)
    }

    /// Read and verify a snapshot file.
    ///
    /// Rejects files without `schemaVersion`, files from a newer format,
    /// and files whose row count or checksum do not match their data.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let contents = std::fs::read(path)
            .map_err(|e| SyncError::snapshot(path, format!("failed to read: {}", e)))?;
        let snapshot: Snapshot = serde_json::from_slice(&contents)
            .map_err(|e| SyncError::snapshot(path, format!("not a valid snapshot: {}", e)))?;

        snapshot.verify(path)?;
        Ok(snapshot)
    }

    fn verify(&self, path: &Path) -> SyncResult<()> {
        let meta = &self.metadata;
        match meta.schema_version {
            0 => return Err(SyncError::snapshot(path, "missing schemaVersion")),
            v if v > SNAPSHOT_SCHEMA_VERSION => {
                return Err(SyncError::snapshot(
                    path,
                    format!(
                        "schemaVersion {} is newer than supported version {}",
                        v, SNAPSHOT_SCHEMA_VERSION
                    ),
                ))
            }
            _ => {}
        }

        if meta.row_count != self.data.len() {
            return Err(SyncError::validation(
                &meta.source_table,
                format!(
                    "snapshot declares {} rows but contains {}",
                    meta.row_count,
                    self.data.len()
                ),
            ));
        }

        match &meta.checksum {
            Some(expected) if *expected == checksum_of(&self.data) => Ok(()),
            Some(_) => Err(SyncError::validation(
                &meta.source_table,
                "snapshot checksum does not match its data (file was modified or truncated)",
            )),
            None => Err(SyncError::validation(&meta.source_table, "snapshot has no checksum")),
        }
    }
}

/// SHA-256 hex digest of the serialized data array.
pub fn checksum_of(data: &[Row]) -> String {
    let mut hasher = Sha256::new();
    for row in data {
        // Map serialization cannot fail for JSON values.
        if let Ok(bytes) = serde_json::to_vec(row) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
