#![forbid(unsafe_code)]

use crate::domain::{HostId, SeverityCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which external scanner produced (or will produce) a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    /// Emits a JSON document with a nested `Results → Vulnerabilities` list
    /// and takes a filesystem path plus a vulnerability-only scope flag.
    Trivy,
    /// Emits a JSON document with a flat `matches` list and takes a
    /// directory target.
    Grype,
}

impl ScannerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScannerKind::Trivy => "trivy",
            ScannerKind::Grype => "grype",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trivy" => Some(ScannerKind::Trivy),
            "grype" => Some(ScannerKind::Grype),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::InProgress => "in_progress",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

/// One scanner execution against one item on one host. Created when the
/// scan starts and finalized exactly once.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub host: HostId,
    pub item: String,
    pub scanner: ScannerKind,
    pub status: ScanStatus,
    pub counts: SeverityCounts,
    pub started_at: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

impl ScanRecord {
    pub fn started(host: HostId, item: impl Into<String>, scanner: ScannerKind) -> Self {
        Self {
            host,
            item: item.into(),
            scanner,
            status: ScanStatus::InProgress,
            counts: SeverityCounts::default(),
            started_at: Utc::now(),
            duration: None,
            error: None,
        }
    }

    pub fn complete(&mut self, counts: SeverityCounts, duration: Duration) {
        self.status = ScanStatus::Completed;
        self.counts = counts;
        self.duration = Some(duration);
    }

    pub fn fail(&mut self, error: impl Into<String>, duration: Duration) {
        self.status = ScanStatus::Failed;
        self.error = Some(error.into());
        self.duration = Some(duration);
    }
}
