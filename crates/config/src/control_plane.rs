use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::time::Duration;

/// Settings for the backup control-plane gateway.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlPlane {
    /// Address of the control-plane endpoint the gateway connects to.
    pub endpoint: String,

    /// Username used when (re)connecting the control-plane session.
    pub username: String,

    /// Opaque reference into the credential vault for the control-plane
    /// secret. The vault collaborator resolves it; the secret itself never
    /// appears in configuration.
    pub credential_ref: String,

    /// How many times a request is retried after a transient failure
    /// (session not ready, remote process exited) before it is surfaced.
    pub request_retries: u32,

    /// Hard timeout applied to every scripted request.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,

    /// Idle window after which the next request first probes the session
    /// and reconnects with last-known-good credentials if the probe fails.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub liveness_window: Duration,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self {
            endpoint: String::from("localhost"),
            username: String::from("svc-snapscan"),
            credential_ref: String::from("control-plane"),
            request_retries: 3,
            request_timeout: Duration::from_secs(120),
            liveness_window: Duration::from_secs(300),
        }
    }
}
