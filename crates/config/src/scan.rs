use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for scan execution.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Scan {
    /// Hard timeout for a single scan command. Scans of large mounted
    /// filesystems run for minutes, not seconds.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,

    /// Directory on the scan host where scanner output files are written
    /// before being read back.
    pub output_dir: PathBuf,

    /// URL of the known-exploited-vulnerabilities feed consulted once per
    /// scan batch. Fetch failure is non-fatal.
    pub kev_feed_url: String,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(900),
            output_dir: PathBuf::from("/tmp"),
            kev_feed_url: String::from(
                "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json",
            ),
        }
    }
}
