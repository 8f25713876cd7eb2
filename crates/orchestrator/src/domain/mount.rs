#![forbid(unsafe_code)]

use crate::domain::HostId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStatus {
    Mounted,
    Unmounted,
    Failed,
}

impl MountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MountStatus::Mounted => "mounted",
            MountStatus::Unmounted => "unmounted",
            MountStatus::Failed => "failed",
        }
    }
}

/// Persisted audit row for a filesystem mount on a scan host. Independent of
/// any in-memory job so operators can recover after a process restart.
#[derive(Debug, Clone, PartialEq)]
pub struct MountPoint {
    pub host: HostId,
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub options: Option<String>,
    pub status: MountStatus,
}
