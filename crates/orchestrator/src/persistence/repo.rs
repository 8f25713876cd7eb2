#![forbid(unsafe_code)]

use crate::domain::{
    Finding, HostId, MountPoint, MountStatus, ScanRecord, Severity, VulnStatus,
};
use crate::error::Error;
use crate::session::StatusSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A vulnerability row as stored, for triage views and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVulnerability {
    pub id: i64,
    pub severity: Severity,
    pub status: VulnStatus,
    pub first_discovered: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub known_exploited: bool,
}

#[async_trait]
pub trait VulnStore: Send + Sync {
    /// Open a scan row in `in_progress` state; returns its id.
    async fn record_scan_started(&self, record: &ScanRecord) -> Result<i64, Error>;

    /// Finalize a scan row with its terminal status, counts and duration.
    async fn finalize_scan(&self, scan_id: i64, record: &ScanRecord) -> Result<(), Error>;

    /// Upsert a scan's findings inside a single transaction: first-discovered
    /// is preserved, last-seen advances to `seen_at`, and exactly one history
    /// row is appended per finding.
    async fn upsert_findings(
        &self,
        scan_id: i64,
        item: &str,
        findings: &[Finding],
        seen_at: DateTime<Utc>,
        known_exploited: &HashSet<String>,
    ) -> Result<(), Error>;

    async fn record_mount(&self, mount: &MountPoint) -> Result<(), Error>;

    async fn set_mount_status(
        &self,
        host: &HostId,
        path: &Path,
        status: MountStatus,
    ) -> Result<(), Error>;

    async fn set_session_status(&self, host: &HostId, connected: bool) -> Result<(), Error>;

    async fn find_vulnerability(
        &self,
        finding_id: &str,
        package: &str,
        installed_version: &str,
        item: &str,
    ) -> Result<Option<StoredVulnerability>, Error>;

    async fn history_count(&self, vulnerability_id: i64) -> Result<u64, Error>;
}

/// Store that remembers nothing. Used by tests that only exercise the
/// pipeline around persistence.
#[derive(Debug, Default)]
pub struct NoopVulnStore;

#[async_trait]
impl VulnStore for NoopVulnStore {
    async fn record_scan_started(&self, _record: &ScanRecord) -> Result<i64, Error> {
        Ok(0)
    }

    async fn finalize_scan(&self, _scan_id: i64, _record: &ScanRecord) -> Result<(), Error> {
        Ok(())
    }

    async fn upsert_findings(
        &self,
        _scan_id: i64,
        _item: &str,
        _findings: &[Finding],
        _seen_at: DateTime<Utc>,
        _known_exploited: &HashSet<String>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn record_mount(&self, _mount: &MountPoint) -> Result<(), Error> {
        Ok(())
    }

    async fn set_mount_status(
        &self,
        _host: &HostId,
        _path: &Path,
        _status: MountStatus,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn set_session_status(&self, _host: &HostId, _connected: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn find_vulnerability(
        &self,
        _finding_id: &str,
        _package: &str,
        _installed_version: &str,
        _item: &str,
    ) -> Result<Option<StoredVulnerability>, Error> {
        Ok(None)
    }

    async fn history_count(&self, _vulnerability_id: i64) -> Result<u64, Error> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteVulnStore {
    pool: SqlitePool,
}

impl SqliteVulnStore {
    /// Open (or create) the database file and run migrations.
    pub async fn open(path: PathBuf) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        Self::with_options(options).await
    }

    /// In-memory store for tests and stateless runs.
    pub async fn in_memory() -> Result<Self, Error> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl VulnStore for SqliteVulnStore {
    async fn record_scan_started(&self, record: &ScanRecord) -> Result<i64, Error> {
        let row = sqlx::query(
            "INSERT INTO scans (host, item_name, scanner, status, started_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(record.host.as_str())
        .bind(&record.item)
        .bind(record.scanner.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn finalize_scan(&self, scan_id: i64, record: &ScanRecord) -> Result<(), Error> {
        let duration_ms = record.duration.map(|d| d.as_millis() as i64);
        sqlx::query(
            "UPDATE scans SET status = ?, critical = ?, high = ?, medium = ?, low = ?, \
             negligible = ?, duration_ms = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(record.status.as_str())
        .bind(record.counts.critical)
        .bind(record.counts.high)
        .bind(record.counts.medium)
        .bind(record.counts.low)
        .bind(record.counts.negligible)
        .bind(duration_ms)
        .bind(&record.error)
        .bind(Utc::now())
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_findings(
        &self,
        scan_id: i64,
        item: &str,
        findings: &[Finding],
        seen_at: DateTime<Utc>,
        known_exploited: &HashSet<String>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        for finding in findings {
            let exploited = known_exploited.contains(&finding.finding_id);
            let references = finding.references.join("\n");

            let existing = sqlx::query(
                "SELECT id FROM vulnerabilities WHERE finding_id = ? AND package = ? \
                 AND installed_version = ? AND item_name = ?",
            )
            .bind(&finding.finding_id)
            .bind(&finding.package)
            .bind(&finding.installed_version)
            .bind(item)
            .fetch_optional(&mut *tx)
            .await?;

            let vulnerability_id: i64 = match existing {
                Some(row) => {
                    let id: i64 = row.try_get("id")?;
                    // first_discovered and triage status are deliberately
                    // untouched; scanning only ever advances last_seen.
                    sqlx::query(
                        "UPDATE vulnerabilities SET severity = ?, fixed_version = ?, \
                         description = ?, reference_links = ?, published = ?, last_seen = ?, \
                         known_exploited = known_exploited OR ? WHERE id = ?",
                    )
                    .bind(finding.severity.to_string())
                    .bind(&finding.fixed_version)
                    .bind(&finding.description)
                    .bind(references)
                    .bind(finding.published)
                    .bind(seen_at)
                    .bind(exploited)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    id
                }
                None => {
                    let row = sqlx::query(
                        "INSERT INTO vulnerabilities (finding_id, package, installed_version, \
                         item_name, severity, fixed_version, description, reference_links, \
                         published, status, first_discovered, last_seen, known_exploited) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?) RETURNING id",
                    )
                    .bind(&finding.finding_id)
                    .bind(&finding.package)
                    .bind(&finding.installed_version)
                    .bind(item)
                    .bind(finding.severity.to_string())
                    .bind(&finding.fixed_version)
                    .bind(&finding.description)
                    .bind(references)
                    .bind(finding.published)
                    .bind(seen_at)
                    .bind(seen_at)
                    .bind(exploited)
                    .fetch_one(&mut *tx)
                    .await?;
                    row.try_get("id")?
                }
            };

            sqlx::query(
                "INSERT INTO vulnerability_history (vulnerability_id, scan_id, severity, seen_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(vulnerability_id)
            .bind(scan_id)
            .bind(finding.severity.to_string())
            .bind(seen_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(scan_id, count = findings.len(), "findings upserted");
        Ok(())
    }

    async fn record_mount(&self, mount: &MountPoint) -> Result<(), Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO mount_points (host, device, path, fs_type, options, status, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(mount.host.as_str())
        .bind(&mount.device)
        .bind(mount.path.to_string_lossy().to_string())
        .bind(&mount.fs_type)
        .bind(&mount.options)
        .bind(mount.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_mount_status(
        &self,
        host: &HostId,
        path: &Path,
        status: MountStatus,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE mount_points SET status = ?, updated_at = ? WHERE host = ? AND path = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(host.as_str())
        .bind(path.to_string_lossy().to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_session_status(&self, host: &HostId, connected: bool) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO remote_sessions (host, connected, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (host) DO UPDATE SET connected = excluded.connected, \
             updated_at = excluded.updated_at",
        )
        .bind(host.as_str())
        .bind(connected)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_vulnerability(
        &self,
        finding_id: &str,
        package: &str,
        installed_version: &str,
        item: &str,
    ) -> Result<Option<StoredVulnerability>, Error> {
        let row = sqlx::query(
            "SELECT id, severity, status, first_discovered, last_seen, known_exploited \
             FROM vulnerabilities WHERE finding_id = ? AND package = ? \
             AND installed_version = ? AND item_name = ?",
        )
        .bind(finding_id)
        .bind(package)
        .bind(installed_version)
        .bind(item)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let severity: String = row.try_get("severity")?;
        let status: String = row.try_get("status")?;
        Ok(Some(StoredVulnerability {
            id: row.try_get("id")?,
            severity: Severity::parse(&severity),
            status: VulnStatus::parse(&status).unwrap_or_default(),
            first_discovered: row.try_get("first_discovered")?,
            last_seen: row.try_get("last_seen")?,
            known_exploited: row.try_get("known_exploited")?,
        }))
    }

    async fn history_count(&self, vulnerability_id: i64) -> Result<u64, Error> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM vulnerability_history WHERE vulnerability_id = ?")
                .bind(vulnerability_id)
                .fetch_one(&self.pool)
                .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}

#[async_trait]
impl StatusSink for SqliteVulnStore {
    async fn session_status_changed(&self, host: &HostId, connected: bool) {
        if let Err(err) = self.set_session_status(host, connected).await {
            warn!(%host, connected, %err, "failed to persist session status");
        }
    }
}
