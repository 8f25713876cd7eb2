#![forbid(unsafe_code)]

pub mod clock;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod provision;
pub mod publish;
pub mod scan;
pub mod session;
pub mod vault;

pub use clock::{Clock, InstantClock, SystemClock};
pub use domain::{
    Finding, HostId, JobId, JobState, MountPoint, MountStatus, PublishJob, ScanRecord, ScanStatus,
    ScannerKind, SessionId, Severity, SeverityCounts, VulnStatus,
};
pub use engine::{BatchItem, BatchReport, BatchRequest, ItemOutcome, ScanEngine, Services};
pub use error::Error;
pub use gateway::{
    ALLOWED_OPERATIONS, ControlPlaneGateway, ControlPlaneTransport, FramedResponse, Script,
    extract_frame, parse_framed,
};
pub use persistence::{NoopVulnStore, SqliteVulnStore, StoredVulnerability, VulnStore};
pub use provision::{OsFamily, ProvisioningEngine, ScannerStatus, compare, is_newer};
pub use publish::{MountPointInfo, PublishMachine, PublishRequest};
pub use scan::{KevFeed, NoopKevFeed, ScanExecutor, ScanReport, ShellKevFeed};
pub use session::{
    ExecOpts, NoopStatusSink, OutputChunk, PromptAction, PromptGuard, PromptState, RemoteShell,
    SessionPool, ShellSession, StatusSink,
};
pub use vault::{CredentialVault, Secret, StaticVault};
