#![forbid(unsafe_code)]

mod kev;
mod parser;

pub use kev::{KevFeed, NoopKevFeed, ShellKevFeed};
pub use parser::{ScanReport, normalize, parse_report};

use crate::domain::{Finding, HostId, ScannerKind};
use crate::error::Error;
use crate::session::{ExecOpts, SessionPool};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Runs a scanner against a mounted path and returns normalized findings.
/// Output goes to a uniquely named file on the scan host and is read back
/// afterwards, decoupling large documents from the live command stream.
pub struct ScanExecutor {
    config: config::Scan,
    pool: Arc<SessionPool>,
    sequence: AtomicU64,
}

impl ScanExecutor {
    pub fn new(config: config::Scan, pool: Arc<SessionPool>) -> Self {
        Self {
            config,
            pool,
            sequence: AtomicU64::new(0),
        }
    }

    pub async fn scan(
        &self,
        host: &HostId,
        mount_path: &Path,
        kind: ScannerKind,
    ) -> Result<Vec<Finding>, Error> {
        let output_file = self.output_file(kind);
        let command = build_command(kind, mount_path, &output_file);

        let opts = ExecOpts {
            timeout: Some(self.config.command_timeout),
            silent: true,
        };
        let run_result = self.pool.execute(host, &command, &opts).await;

        // Read the document back before cleanup so a parse error still
        // leaves no file behind.
        let raw = match run_result {
            Ok(_) => {
                self.pool
                    .execute(host, &format!("cat {output_file}"), &opts)
                    .await
            }
            Err(err) => Err(err),
        };

        self.cleanup(host, &output_file).await;

        let raw = raw?;
        let findings = normalize(parse_report(&raw)?)?;
        debug!(%host, scanner = kind.as_str(), count = findings.len(), "scan parsed");
        Ok(findings)
    }

    fn output_file(&self, kind: ScannerKind) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let stamp = chrono::Utc::now().timestamp_millis();
        format!(
            "{}/snapscan-{}-{stamp}-{seq}.json",
            self.config.output_dir.display(),
            kind.as_str()
        )
    }

    /// Best-effort removal of the temporary output file. Failure is logged,
    /// never fatal.
    async fn cleanup(&self, host: &HostId, output_file: &str) {
        let opts = ExecOpts {
            timeout: None,
            silent: true,
        };
        if let Err(err) = self
            .pool
            .execute(host, &format!("rm -f {output_file}"), &opts)
            .await
        {
            warn!(%host, output_file, %err, "failed to remove scan output file");
        }
    }
}

fn build_command(kind: ScannerKind, mount_path: &Path, output_file: &str) -> String {
    let target = mount_path.display();
    match kind {
        ScannerKind::Trivy => format!(
            "trivy rootfs --scanners vuln --format json --output {output_file} {target}"
        ),
        ScannerKind::Grype => format!("grype dir:{target} -o json --file {output_file}"),
    }
}
