use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the scanner provisioning engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Provision {
    /// Directory on the scan host where vulnerability databases are
    /// cached. Kept away from any mount path so the database never
    /// pollutes a scan target.
    pub db_cache_dir: PathBuf,

    /// A vulnerability database older than this is considered stale and
    /// refreshed before the next scan.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub db_freshness_window: Duration,

    /// Hard timeout for install/upgrade and database refresh commands.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub install_timeout: Duration,
}

impl Default for Provision {
    fn default() -> Self {
        Self {
            db_cache_dir: PathBuf::from("/var/cache/snapscan/db"),
            db_freshness_window: Duration::from_secs(24 * 3600),
            install_timeout: Duration::from_secs(600),
        }
    }
}
