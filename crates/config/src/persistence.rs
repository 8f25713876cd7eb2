use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings for the relational store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Persistence {
    /// Path of the SQLite database file. `None` keeps state in memory,
    /// which is only useful for tests and one-off runs.
    pub db_path: Option<PathBuf>,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("/var/lib/snapscan/snapscan.db")),
        }
    }
}
