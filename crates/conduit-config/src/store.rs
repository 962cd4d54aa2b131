use std::path::PathBuf;

use serde::Deserialize;

/// Persistent store backend
///
/// Every gateway process sharing one deployment must point at the same
/// database; cross-process coherence relies on it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store, for tests and single-process trials
    #[default]
    Memory,
    /// SQLite database file
    Sqlite { path: PathBuf },
}
