#![forbid(unsafe_code)]

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session not ready or the remote process exited. Recovered locally by
    /// bounded retry; surfaced only once the retry budget is spent.
    #[error("transient remote failure: {0}")]
    TransientRemote(String),

    /// The mount never became ready within the verification attempt budget.
    #[error("mount not ready after {attempts} verification attempts: {last_error}")]
    VerificationTimeout { attempts: u32, last_error: String },

    /// The request referenced an operation outside the allow-list. Rejected
    /// locally, never sent remotely.
    #[error("operation {0:?} is not on the control-plane allow-list")]
    UnauthorizedOperation(String),

    /// Scan host OS family not recognized; no provisioning is attempted.
    #[error("unsupported platform on host {host}: {detail}")]
    UnsupportedPlatform { host: String, detail: String },

    /// Scanner output matched neither known shape, or framing was broken.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("remote command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("command failed on {host}: {detail}")]
    CommandFailed { host: String, detail: String },

    #[error("no session pooled for host {0}")]
    SessionMissing(String),

    #[error("session for host {0} evicted after exhausting reconnect attempts")]
    SessionEvicted(String),

    #[error("privilege prompt answered {0} times without being accepted")]
    PromptRejected(u32),

    /// The control plane answered with `success: false`. `code` is its
    /// machine-readable discriminator, when the reply carries one.
    #[error("control plane reported failure: {message}")]
    ControlPlane {
        code: Option<String>,
        message: String,
    },

    #[error("publish job not found")]
    JobMissing,

    #[error("publish/verify cancelled")]
    Cancelled,

    #[error("credential reference {0:?} could not be resolved")]
    CredentialUnavailable(String),

    #[error("database path missing parent directory: {0}")]
    BadDatabasePath(PathBuf),

    #[error(transparent)]
    Persistence(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error belongs to the transient-remote class that the
    /// gateway and pool retry automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientRemote(_))
    }
}
