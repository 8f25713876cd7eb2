#![forbid(unsafe_code)]

mod version;

pub use version::{compare, is_newer};

use crate::domain::{HostId, ScannerKind};
use crate::error::Error;
use crate::session::{ExecOpts, SessionPool};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    Rhel,
}

/// Outcome of one provisioning pass. A second pass with no intervening
/// change on the host reports neither an upgrade nor a database refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub upgraded: bool,
    pub db_refreshed: bool,
}

/// Idempotently ensures a scanner binary and its vulnerability database are
/// installed and current on a scan host.
pub struct ProvisioningEngine {
    config: config::Provision,
    pool: Arc<SessionPool>,
}

impl ProvisioningEngine {
    pub fn new(config: config::Provision, pool: Arc<SessionPool>) -> Self {
        Self { config, pool }
    }

    pub async fn ensure_scanner(
        &self,
        host: &HostId,
        kind: ScannerKind,
    ) -> Result<ScannerStatus, Error> {
        let os = self.detect_os(host).await?;
        let installed = self.installed_version(host, kind).await;
        let latest = self.latest_version(host, kind, os).await;

        let needs_install = match (&installed, &latest) {
            (None, _) => true,
            (Some(installed), Some(latest)) => is_newer(latest, installed),
            (Some(_), None) => false,
        };

        let mut upgraded = false;
        if needs_install {
            info!(%host, scanner = kind.as_str(), ?installed, ?latest, "installing scanner");
            self.install(host, kind, os).await?;
            upgraded = true;
        } else {
            debug!(%host, scanner = kind.as_str(), ?installed, "scanner already current");
        }

        let version = if upgraded {
            let fresh = self.query_installed_version(host, kind).await;
            if let Some(fresh) = &fresh {
                self.pool
                    .cache_scanner_version(host, kind.as_str(), fresh)
                    .await;
            }
            fresh
        } else {
            installed
        };

        let db_refreshed = self.ensure_database(host, kind).await?;

        Ok(ScannerStatus {
            installed: version.is_some() || upgraded,
            version,
            upgraded,
            db_refreshed,
        })
    }

    /// Two supported OS families; anything else is an unsupported-platform
    /// error and provisioning stops before any package operation.
    async fn detect_os(&self, host: &HostId) -> Result<OsFamily, Error> {
        let output = self
            .pool
            .execute(host, "cat /etc/os-release", &ExecOpts::default())
            .await?;
        let mut id = None;
        let mut id_like = None;
        for line in output.lines() {
            if let Some(value) = line.strip_prefix("ID=") {
                id = Some(value.trim_matches('"').to_ascii_lowercase());
            } else if let Some(value) = line.strip_prefix("ID_LIKE=") {
                id_like = Some(value.trim_matches('"').to_ascii_lowercase());
            }
        }
        let haystack = format!(
            "{} {}",
            id.clone().unwrap_or_default(),
            id_like.unwrap_or_default()
        );
        if ["debian", "ubuntu"].iter().any(|s| haystack.contains(s)) {
            return Ok(OsFamily::Debian);
        }
        if ["rhel", "fedora", "centos", "rocky", "almalinux"]
            .iter()
            .any(|s| haystack.contains(s))
        {
            return Ok(OsFamily::Rhel);
        }
        Err(Error::UnsupportedPlatform {
            host: host.to_string(),
            detail: format!("os-release id {:?}", id),
        })
    }

    /// Installed version, preferring the inventory cached on the session so
    /// repeat provisioning passes stay off the wire.
    async fn installed_version(&self, host: &HostId, kind: ScannerKind) -> Option<String> {
        if let Some(cached) = self.pool.cached_scanner_version(host, kind.as_str()).await {
            return Some(cached);
        }
        let version = self.query_installed_version(host, kind).await;
        if let Some(version) = &version {
            self.pool
                .cache_scanner_version(host, kind.as_str(), version)
                .await;
        }
        version
    }

    async fn query_installed_version(&self, host: &HostId, kind: ScannerKind) -> Option<String> {
        let command = match kind {
            ScannerKind::Trivy => "trivy --version",
            ScannerKind::Grype => "grype version",
        };
        let output = self
            .pool
            .execute(host, command, &ExecOpts::default())
            .await
            .ok()?;
        parse_version_line(&output)
    }

    async fn latest_version(
        &self,
        host: &HostId,
        kind: ScannerKind,
        os: OsFamily,
    ) -> Option<String> {
        let package = kind.as_str();
        let command = match os {
            OsFamily::Debian => format!("apt-cache policy {package}"),
            OsFamily::Rhel => {
                format!("dnf --quiet repoquery --latest-limit 1 --qf '%{{version}}' {package}")
            }
        };
        let output = self
            .pool
            .execute(host, &command, &ExecOpts::default())
            .await
            .ok()?;
        match os {
            OsFamily::Debian => output
                .lines()
                .find_map(|line| line.trim().strip_prefix("Candidate:"))
                .map(|v| v.trim().to_string())
                .filter(|v| v != "(none)"),
            OsFamily::Rhel => {
                let v = output.trim();
                (!v.is_empty()).then(|| v.to_string())
            }
        }
    }

    async fn install(&self, host: &HostId, kind: ScannerKind, os: OsFamily) -> Result<(), Error> {
        let package = kind.as_str();
        let command = match os {
            OsFamily::Debian => format!("sudo apt-get install -y {package}"),
            OsFamily::Rhel => format!("sudo dnf install -y {package}"),
        };
        let opts = ExecOpts {
            timeout: Some(self.config.install_timeout),
            silent: true,
        };
        self.pool.execute(host, &command, &opts).await?;
        Ok(())
    }

    /// Refresh the scanner's vulnerability database if it is stale. The
    /// database lives in an isolated cache path, never under a scan mount.
    async fn ensure_database(&self, host: &HostId, kind: ScannerKind) -> Result<bool, Error> {
        let cache = self.config.db_cache_dir.join(kind.as_str());
        let cache = cache.display();

        let stale = match kind {
            ScannerKind::Trivy => {
                let output = self
                    .pool
                    .execute(
                        host,
                        &format!("cat {cache}/db/metadata.json"),
                        &ExecOpts { timeout: None, silent: true },
                    )
                    .await;
                match output {
                    Ok(text) => trivy_db_is_stale(&text, Utc::now()),
                    Err(_) => true,
                }
            }
            ScannerKind::Grype => {
                let output = self
                    .pool
                    .execute(
                        host,
                        &format!("GRYPE_DB_CACHE_DIR={cache} grype db status -o json"),
                        &ExecOpts { timeout: None, silent: true },
                    )
                    .await;
                match output {
                    Ok(text) => grype_db_is_stale(&text, Utc::now(), self.config.db_freshness_window),
                    Err(_) => true,
                }
            }
        };

        if !stale {
            debug!(%host, scanner = kind.as_str(), "vulnerability database is fresh");
            return Ok(false);
        }

        info!(%host, scanner = kind.as_str(), "refreshing vulnerability database");
        let command = match kind {
            ScannerKind::Trivy => {
                format!("trivy --cache-dir {cache} image --download-db-only")
            }
            ScannerKind::Grype => format!("GRYPE_DB_CACHE_DIR={cache} grype db update"),
        };
        let opts = ExecOpts {
            timeout: Some(self.config.install_timeout),
            silent: true,
        };
        if let Err(err) = self.pool.execute(host, &command, &opts).await {
            // A stale database still scans; refresh failure is surfaced in
            // logs and retried on the next pass.
            warn!(%host, %err, "database refresh failed");
            return Ok(false);
        }
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct TrivyDbMetadata {
    #[serde(rename = "NextUpdate")]
    next_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GrypeDbStatus {
    built: Option<DateTime<Utc>>,
}

/// Trivy embeds the moment the database expires; past it, the DB is stale.
fn trivy_db_is_stale(metadata_json: &str, now: DateTime<Utc>) -> bool {
    match serde_json::from_str::<TrivyDbMetadata>(metadata_json) {
        Ok(TrivyDbMetadata {
            next_update: Some(next),
        }) => next <= now,
        _ => true,
    }
}

/// Grype reports a build time; older than the freshness window is stale.
fn grype_db_is_stale(status_json: &str, now: DateTime<Utc>, window: Duration) -> bool {
    let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::hours(24));
    match serde_json::from_str::<GrypeDbStatus>(status_json) {
        Ok(GrypeDbStatus { built: Some(built) }) => now - built > window,
        _ => true,
    }
}

fn parse_version_line(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Version:")
            .map(|v| v.trim().to_string())
    })
}
