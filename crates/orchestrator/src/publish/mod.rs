#![forbid(unsafe_code)]

use crate::clock::Clock;
use crate::domain::{HostId, JobId, JobState, PublishJob, SessionId};
use crate::error::Error;
use crate::gateway::{ControlPlaneGateway, Script};
use serde::Deserialize;
use slotmap::SlotMap;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a caller asks to have mounted.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub item: String,
    pub restore_point: String,
    pub disks: Vec<String>,
    pub host: HostId,
}

/// Error code the control plane answers with when an unpublish names a
/// session it no longer tracks.
const SESSION_NOT_FOUND: &str = "session-not-found";

#[derive(Debug, Deserialize)]
struct PublishData {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    #[serde(default)]
    mount_points: Vec<MountPointInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountPointInfo {
    pub disk: String,
    pub path: PathBuf,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub fs_type: Option<String>,
}

/// Drives a job from publish through verification to Mounted or Failed,
/// and reverses it on unmount. Owns the in-memory job registry.
pub struct PublishMachine {
    config: config::Publish,
    gateway: Arc<ControlPlaneGateway>,
    clock: Arc<dyn Clock>,
    jobs: Mutex<SlotMap<JobId, PublishJob>>,
}

impl PublishMachine {
    pub fn new(
        config: config::Publish,
        gateway: Arc<ControlPlaneGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            gateway,
            clock,
            jobs: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Snapshot of a job, if it is still tracked.
    pub async fn job(&self, id: JobId) -> Option<PublishJob> {
        self.jobs.lock().await.get(id).cloned()
    }

    /// Publish the requested disks and poll until they are mounted. The
    /// whole publish+verify sequence is retried as a unit, as an explicit
    /// bounded loop, to absorb transient control-plane hiccups. Only a
    /// Mounted job is registered; a failed attempt's session is unpublished
    /// best-effort before the next attempt, so an exhausted job never
    /// leaves the backup published on the scan host.
    pub async fn publish_and_verify(
        &self,
        request: &PublishRequest,
        cancel: &CancellationToken,
    ) -> Result<JobId, Error> {
        let attempts = self.config.job_retries.max(1);
        let mut last: Option<Error> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.wait(self.config.job_retry_backoff, cancel).await?;
            }
            match self.run_attempt(request, cancel).await {
                Ok(job) => {
                    info!(item = %request.item, host = %request.host, "publish job mounted");
                    return Ok(self.jobs.lock().await.insert(job));
                }
                Err((job, err)) => {
                    self.release(&job).await;
                    if matches!(err, Error::Cancelled) {
                        return Err(err);
                    }
                    warn!(item = %request.item, attempt, %err, "publish attempt failed");
                    last = Some(err);
                }
            }
        }

        // attempts >= 1, so at least one pass recorded its error
        Err(last.expect("at least one attempt ran"))
    }

    /// One publish+verify pass over a fresh job.
    async fn run_attempt(
        &self,
        request: &PublishRequest,
        cancel: &CancellationToken,
    ) -> Result<PublishJob, (PublishJob, Error)> {
        let mut job = PublishJob::new(
            request.item.clone(),
            request.restore_point.clone(),
            request.disks.clone(),
            request.host.clone(),
        );

        // Publish. Failure here is terminal for the attempt; verification
        // is never entered without a session id.
        let session = match self.publish(request).await {
            Ok(session) => session,
            Err(err) => {
                job.fail(err.to_string());
                return Err((job, err));
            }
        };
        job.session = Some(session.clone());
        job.transition(JobState::Verifying);

        // The mount is never instantaneously ready.
        if let Err(err) = self.wait(self.config.initial_wait, cancel).await {
            job.fail(err.to_string());
            return Err((job, err));
        }

        let verify_attempts = self.config.verify_attempts.max(1);
        let mut last_error = String::from("no mount points reported");
        for attempt in 1..=verify_attempts {
            match self.verify(&session, &request.disks).await {
                Ok(Some(mounts)) => {
                    job.set_mounts(mounts);
                    job.transition(JobState::Mounted);
                    return Ok(job);
                }
                Ok(None) => {
                    debug!(attempt, item = %request.item, "mounts not ready yet");
                }
                Err(err) => {
                    debug!(attempt, %err, "verification attempt failed");
                    last_error = err.to_string();
                }
            }
            if attempt < verify_attempts
                && let Err(err) = self.wait(self.config.verify_interval, cancel).await
            {
                job.fail(err.to_string());
                return Err((job, err));
            }
        }

        let err = Error::VerificationTimeout {
            attempts: verify_attempts,
            last_error,
        };
        job.fail(err.to_string());
        Err((job, err))
    }

    async fn publish(&self, request: &PublishRequest) -> Result<SessionId, Error> {
        let body = serde_json::json!({
            "op": "publish-backup",
            "item": request.item,
            "restore_point": request.restore_point,
            "disks": request.disks,
            "target_host": request.host.as_str(),
        });
        let script = Script::new("publish-backup", body.to_string());
        let response = self.gateway.execute_framed(&script).await?;
        let data: PublishData = decode_data(response.data)?;
        Ok(SessionId::new(data.session_id))
    }

    /// Ask the control plane for the session's current disk/mount-point
    /// mapping. Returns the normalized mounts once every requested disk has
    /// at least one accepted mount point, `None` while incomplete.
    async fn verify(
        &self,
        session: &SessionId,
        disks: &[String],
    ) -> Result<Option<BTreeMap<String, PathBuf>>, Error> {
        let body = serde_json::json!({ "op": "verify-mount", "session_id": session.as_str() });
        let script = Script::new("verify-mount", body.to_string());
        let response = self.gateway.execute_framed(&script).await?;
        let data: VerifyData = decode_data(response.data)?;

        let mut accepted: BTreeMap<String, PathBuf> = BTreeMap::new();
        for info in data.mount_points {
            if !info.path.starts_with(&self.config.mount_root) {
                warn!(path = %info.path.display(), "ignoring mount point outside mount root");
                continue;
            }
            let normalized = normalize_mount_path(&self.config.mount_root, &info.path);
            accepted.entry(info.disk).or_insert(normalized);
        }

        if disks.iter().all(|disk| accepted.contains_key(disk)) {
            accepted.retain(|disk, _| disks.contains(disk));
            Ok(Some(accepted))
        } else {
            Ok(None)
        }
    }

    /// Reverse a publish. A session the control plane no longer knows is
    /// success, not failure: the desired end state already holds. The job
    /// entry is cleared only after the control-plane acknowledgment, so a
    /// crash mid-unmount leaves the record retryable.
    pub async fn unmount(&self, id: JobId) -> Result<(), Error> {
        let session = {
            let jobs = self.jobs.lock().await;
            let job = jobs.get(id).ok_or(Error::JobMissing)?;
            job.session.clone()
        };

        if let Some(session) = session {
            self.unpublish(&session).await?;
        }

        self.jobs.lock().await.remove(id);
        info!(?id, "publish job unmounted");
        Ok(())
    }

    /// Send the unpublish request for a session, treating a session the
    /// control plane no longer knows as already unpublished. Dispatch is on
    /// the reply's error code; the message fallback covers agents that
    /// predate the code field.
    async fn unpublish(&self, session: &SessionId) -> Result<(), Error> {
        let body = serde_json::json!({ "op": "unpublish", "session_id": session.as_str() });
        let script = Script::new("unpublish", body.to_string());
        match self.gateway.execute_framed(&script).await {
            Ok(_) => Ok(()),
            Err(Error::ControlPlane { code, message })
                if code.as_deref() == Some(SESSION_NOT_FOUND)
                    || message.to_ascii_lowercase().contains("not found") =>
            {
                debug!(%session, "session already gone, treating unpublish as done");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort teardown of a failed attempt's session. Errors are
    /// logged, never propagated: the attempt already failed.
    async fn release(&self, job: &PublishJob) {
        let Some(session) = job.session.clone() else {
            return;
        };
        if let Err(err) = self.unpublish(&session).await {
            warn!(%session, %err, "failed to unpublish after failed attempt");
        }
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Error> {
        // cancellation observed between waits must win over a zero-length
        // sleep, so check before racing the timer
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(data: Option<serde_json::Value>) -> Result<T, Error> {
    let value = data.ok_or_else(|| Error::ParseFailure("reply carries no data payload".into()))?;
    serde_json::from_value(value)
        .map_err(|err| Error::ParseFailure(format!("unexpected data payload: {err}")))
}

/// Reduce an accepted mount point to its canonical mount root:
/// `<root>/<session>/<disk>`. Deeper volume paths inside one disk all
/// collapse to the same root.
fn normalize_mount_path(root: &Path, path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix(root) else {
        return path.to_path_buf();
    };
    let mut normalized = root.to_path_buf();
    for component in rest.components().take(2) {
        if let Component::Normal(part) = component {
            normalized.push(part);
        }
    }
    normalized
}
