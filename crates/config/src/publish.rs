use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the publish/verify state machine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Publish {
    /// Delay between a successful publish request and the first
    /// verification attempt. Mounts are never instantaneously ready.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_wait: Duration,

    /// Maximum number of verification attempts per publish.
    pub verify_attempts: u32,

    /// Fixed delay between verification attempts.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub verify_interval: Duration,

    /// How many times the whole publish+verify sequence is retried when
    /// any step fails, to absorb transient control-plane hiccups.
    pub job_retries: u32,

    /// Backoff between whole-job retries.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub job_retry_backoff: Duration,

    /// Root under which the publish mechanism mounts disks on the scan
    /// host. Mount points reported outside this root are logged and
    /// ignored during verification.
    pub mount_root: PathBuf,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(10),
            verify_attempts: 5,
            verify_interval: Duration::from_secs(15),
            job_retries: 3,
            job_retry_backoff: Duration::from_secs(5),
            mount_root: PathBuf::from("/tmp/snapscan.mount"),
        }
    }
}
