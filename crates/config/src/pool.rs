use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::time::Duration;

/// Settings for the remote session pool.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Pool {
    /// Interval between proactive keep-alive probes of an active session.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive_interval: Duration,

    /// Interval of the background sweep that probes every pooled session
    /// and evicts the ones that no longer answer.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,

    /// How many reconnect attempts a failing session gets before it is
    /// evicted from the pool.
    pub reconnect_attempts: u32,

    /// Default hard timeout for a remote command when the caller does not
    /// supply one.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,

    /// Maximum number of times the cached secret is written in answer to a
    /// privilege-elevation prompt within a single command before the
    /// command is failed outright.
    pub prompt_responses: u32,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            reconnect_attempts: 3,
            command_timeout: Duration::from_secs(60),
            prompt_responses: 3,
        }
    }
}
