#![forbid(unsafe_code)]

use crate::clock::Clock;
use crate::domain::{
    HostId, JobId, MountPoint, MountStatus, ScanRecord, ScanStatus, ScannerKind, SeverityCounts,
};
use crate::error::Error;
use crate::persistence::VulnStore;
use crate::provision::ProvisioningEngine;
use crate::publish::{PublishMachine, PublishRequest};
use crate::scan::{KevFeed, ScanExecutor};
use crate::session::SessionPool;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the engine drives, injected at construction. No ambient
/// globals; lifecycle is owned by the process entry point.
pub struct Services {
    pub machine: Arc<PublishMachine>,
    pub pool: Arc<SessionPool>,
    pub provisioner: Arc<ProvisioningEngine>,
    pub executor: Arc<ScanExecutor>,
    pub store: Arc<dyn VulnStore>,
    pub kev: Arc<dyn KevFeed>,
    pub clock: Arc<dyn Clock>,
}

/// One backup item to publish and scan.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub item: String,
    pub restore_point: String,
    pub disks: Vec<String>,
}

/// A batch of items scanned sequentially on one host with one scanner.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub host: HostId,
    pub username: String,
    pub credential_ref: String,
    pub scanner: ScannerKind,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub item: String,
    pub status: ScanStatus,
    pub counts: SeverityCounts,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn failed_items(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status != ScanStatus::Completed)
            .count()
    }
}

pub struct ScanEngine {
    services: Services,
}

impl ScanEngine {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Process a batch: items run sequentially, and one item failing never
    /// aborts the rest. The report carries per-item outcomes.
    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, Error> {
        self.services
            .pool
            .connect(&request.host, &request.username, &request.credential_ref)
            .await?;

        // Consulted once per batch, not once per finding. Failure is
        // non-fatal: no finding gets marked known-exploited.
        let known_exploited = match self.services.kev.fetch(&request.host).await {
            Ok(set) => set,
            Err(err) => {
                warn!(%err, "KEV feed unavailable, continuing without it");
                HashSet::new()
            }
        };

        let mut report = BatchReport::default();
        for item in &request.items {
            if cancel.is_cancelled() {
                report.outcomes.push(ItemOutcome {
                    item: item.item.clone(),
                    status: ScanStatus::Cancelled,
                    counts: SeverityCounts::default(),
                    error: Some(Error::Cancelled.to_string()),
                });
                continue;
            }
            let outcome = self
                .run_item(request, item, &known_exploited, cancel)
                .await;
            report.outcomes.push(outcome);
        }

        info!(
            total = report.outcomes.len(),
            failed = report.failed_items(),
            "batch finished"
        );
        Ok(report)
    }

    async fn run_item(
        &self,
        request: &BatchRequest,
        item: &BatchItem,
        known_exploited: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let started = self.services.clock.now();

        // A previous item may have cost us the session (e.g. a command
        // timeout evicts it); reconnecting an intact session is a no-op.
        if let Err(err) = self
            .services
            .pool
            .connect(&request.host, &request.username, &request.credential_ref)
            .await
        {
            return ItemOutcome {
                item: item.item.clone(),
                status: ScanStatus::Failed,
                counts: SeverityCounts::default(),
                error: Some(err.to_string()),
            };
        }

        let mut record = ScanRecord::started(request.host.clone(), &item.item, request.scanner);
        let scan_id = match self.services.store.record_scan_started(&record).await {
            Ok(id) => id,
            Err(err) => {
                return ItemOutcome {
                    item: item.item.clone(),
                    status: ScanStatus::Failed,
                    counts: SeverityCounts::default(),
                    error: Some(err.to_string()),
                };
            }
        };

        let publish_request = PublishRequest {
            item: item.item.clone(),
            restore_point: item.restore_point.clone(),
            disks: item.disks.clone(),
            host: request.host.clone(),
        };

        let job_id = match self
            .services
            .machine
            .publish_and_verify(&publish_request, cancel)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                return self.finalize_failed(scan_id, &mut record, err, started).await;
            }
        };

        let outcome = self
            .scan_mounted(request, item, scan_id, &mut record, job_id, known_exploited, started)
            .await;

        self.teardown(job_id, &request.host).await;
        outcome
    }

    /// Provision, scan every mounted disk, and persist the results.
    #[allow(clippy::too_many_arguments)]
    async fn scan_mounted(
        &self,
        request: &BatchRequest,
        item: &BatchItem,
        scan_id: i64,
        record: &mut ScanRecord,
        job_id: JobId,
        known_exploited: &HashSet<String>,
        started: std::time::Instant,
    ) -> ItemOutcome {
        let Some(job) = self.services.machine.job(job_id).await else {
            return self
                .finalize_failed(scan_id, record, Error::JobMissing, started)
                .await;
        };

        for (disk, path) in job.mounts() {
            let mount = MountPoint {
                host: request.host.clone(),
                device: disk.clone(),
                path: path.clone(),
                fs_type: String::from("auto"),
                options: None,
                status: MountStatus::Mounted,
            };
            if let Err(err) = self.services.store.record_mount(&mount).await {
                warn!(%err, "failed to record mount audit row");
            }
        }

        if let Err(err) = self
            .services
            .provisioner
            .ensure_scanner(&request.host, request.scanner)
            .await
        {
            return self.finalize_failed(scan_id, record, err, started).await;
        }

        let mut findings = Vec::new();
        for (disk, path) in job.mounts() {
            match self
                .services
                .executor
                .scan(&request.host, path, request.scanner)
                .await
            {
                Ok(mut disk_findings) => findings.append(&mut disk_findings),
                Err(err) => {
                    warn!(disk, %err, "scan failed");
                    return self.finalize_failed(scan_id, record, err, started).await;
                }
            }
        }

        let counts = SeverityCounts::tally(&findings);
        if let Err(err) = self
            .services
            .store
            .upsert_findings(scan_id, &item.item, &findings, Utc::now(), known_exploited)
            .await
        {
            // Transaction rolled back in full: the scan is reported failed
            // even though the remote command succeeded.
            return self.finalize_failed(scan_id, record, err, started).await;
        }

        record.complete(counts, self.services.clock.now().duration_since(started));
        if let Err(err) = self.services.store.finalize_scan(scan_id, record).await {
            warn!(%err, "failed to finalize scan record");
        }

        ItemOutcome {
            item: item.item.clone(),
            status: ScanStatus::Completed,
            counts,
            error: None,
        }
    }

    async fn finalize_failed(
        &self,
        scan_id: i64,
        record: &mut ScanRecord,
        err: Error,
        started: std::time::Instant,
    ) -> ItemOutcome {
        let status = if matches!(err, Error::Cancelled) {
            ScanStatus::Cancelled
        } else {
            ScanStatus::Failed
        };
        record.fail(err.to_string(), self.services.clock.now().duration_since(started));
        record.status = status;
        if let Err(store_err) = self.services.store.finalize_scan(scan_id, record).await {
            warn!(%store_err, "failed to finalize scan record");
        }
        ItemOutcome {
            item: record.item.clone(),
            status,
            counts: SeverityCounts::default(),
            error: record.error.clone(),
        }
    }

    /// Unpublish and flip the mount audit rows. Teardown tolerates prior
    /// partial failure; errors are logged, never propagated.
    async fn teardown(&self, job_id: JobId, host: &HostId) {
        let mounts = self
            .services
            .machine
            .job(job_id)
            .await
            .map(|job| job.mounts().clone())
            .unwrap_or_default();

        match self.services.machine.unmount(job_id).await {
            Ok(()) => {
                for path in mounts.values() {
                    if let Err(err) = self
                        .services
                        .store
                        .set_mount_status(host, path, MountStatus::Unmounted)
                        .await
                    {
                        warn!(%err, "failed to update mount audit row");
                    }
                }
            }
            Err(err) => {
                warn!(%err, "unmount failed, mount rows left for retry");
                for path in mounts.values() {
                    let _ = self
                        .services
                        .store
                        .set_mount_status(host, path, MountStatus::Failed)
                        .await;
                }
            }
        }
    }
}
