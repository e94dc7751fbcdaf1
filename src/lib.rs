// ABOUTME: Library root for table-promoter
// ABOUTME: Exposes config, providers and the snapshot/diff/apply engine to the CLI and tests

pub mod config;
pub mod error;
pub mod interactive;
pub mod provider;
pub mod report;
pub mod sync;
pub mod utils;
pub mod value;

pub use config::{DuplicatePolicy, SyncConfig, TableSyncSpec};
pub use error::{SyncError, SyncResult};
pub use provider::{connect, Connection};
pub use sync::{RunOptions, RunReport, TableStatus};
