#![forbid(unsafe_code)]

use crate::domain::{HostId, SessionId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Publishing,
    Verifying,
    Mounted,
    Failed,
}

impl JobState {
    /// Transitions are monotonic: Publishing → Verifying → {Mounted, Failed}.
    /// A job never re-enters an earlier state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Publishing, JobState::Verifying)
                | (JobState::Publishing, JobState::Failed)
                | (JobState::Verifying, JobState::Mounted)
                | (JobState::Verifying, JobState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Mounted | JobState::Failed)
    }
}

/// One (backup item, disk selection) pair being mounted on a scan host.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub item: String,
    pub restore_point: String,
    pub disks: Vec<String>,
    pub host: HostId,
    state: JobState,
    pub session: Option<SessionId>,
    mounts: BTreeMap<String, PathBuf>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PublishJob {
    pub fn new(
        item: impl Into<String>,
        restore_point: impl Into<String>,
        disks: Vec<String>,
        host: HostId,
    ) -> Self {
        let now = Utc::now();
        Self {
            item: item.into(),
            restore_point: restore_point.into(),
            disks,
            host,
            state: JobState::Publishing,
            session: None,
            mounts: BTreeMap::new(),
            created_at: now,
            state_changed_at: now,
            last_error: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Disk name → canonical mount root. Empty until the job is Mounted.
    pub fn mounts(&self) -> &BTreeMap<String, PathBuf> {
        &self.mounts
    }

    /// Apply a state transition. Illegal transitions are ignored and
    /// reported as `false`; the mount list is only populated on the
    /// transition into Mounted and is immutable afterwards.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.state_changed_at = Utc::now();
        true
    }

    pub fn set_mounts(&mut self, mounts: BTreeMap<String, PathBuf>) -> bool {
        if self.state != JobState::Verifying || !self.mounts.is_empty() {
            return false;
        }
        self.mounts = mounts;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.transition(JobState::Failed);
    }
}
