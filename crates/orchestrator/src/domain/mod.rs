#![forbid(unsafe_code)]

mod ids;
mod job;
mod mount;
mod scan;
mod vulnerability;

pub use ids::{HostId, JobId, SessionId};
pub use job::{JobState, PublishJob};
pub use mount::{MountPoint, MountStatus};
pub use scan::{ScanRecord, ScanStatus, ScannerKind};
pub use vulnerability::{Finding, Severity, SeverityCounts, VulnStatus};
