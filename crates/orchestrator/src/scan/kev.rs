#![forbid(unsafe_code)]

use crate::domain::HostId;
use crate::error::Error;
use crate::session::{ExecOpts, SessionPool};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Known-exploited-vulnerabilities reference list, consulted once per scan
/// batch. Fetch failure is non-fatal to the batch; the caller simply marks
/// no finding as known-exploited.
#[async_trait]
pub trait KevFeed: Send + Sync {
    async fn fetch(&self, host: &HostId) -> Result<HashSet<String>, Error>;
}

#[derive(Debug, Default)]
pub struct NoopKevFeed;

#[async_trait]
impl KevFeed for NoopKevFeed {
    async fn fetch(&self, _host: &HostId) -> Result<HashSet<String>, Error> {
        Ok(HashSet::new())
    }
}

#[derive(Debug, Deserialize)]
struct KevDocument {
    #[serde(default)]
    vulnerabilities: Vec<KevEntry>,
}

#[derive(Debug, Deserialize)]
struct KevEntry {
    #[serde(rename = "cveID")]
    cve_id: String,
}

/// Fetches the feed with `curl` through the scan host's session, so no
/// HTTP stack is needed in-process.
pub struct ShellKevFeed {
    pool: Arc<SessionPool>,
    url: String,
}

impl ShellKevFeed {
    pub fn new(pool: Arc<SessionPool>, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
        }
    }
}

#[async_trait]
impl KevFeed for ShellKevFeed {
    async fn fetch(&self, host: &HostId) -> Result<HashSet<String>, Error> {
        let command = format!("curl -fsS {}", self.url);
        let output = self
            .pool
            .execute(
                host,
                &command,
                &ExecOpts {
                    timeout: None,
                    silent: true,
                },
            )
            .await?;
        let document: KevDocument = serde_json::from_str(&output)
            .map_err(|err| Error::ParseFailure(format!("bad KEV feed document: {err}")))?;
        Ok(document
            .vulnerabilities
            .into_iter()
            .map(|entry| entry.cve_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kev_document_decodes() {
        let doc: KevDocument = serde_json::from_str(
            r#"{"title":"KEV","vulnerabilities":[{"cveID":"CVE-2021-44228"},{"cveID":"CVE-2023-1234"}]}"#,
        )
        .unwrap();
        let ids: HashSet<String> = doc.vulnerabilities.into_iter().map(|e| e.cve_id).collect();
        assert!(ids.contains("CVE-2021-44228"));
        assert_eq!(ids.len(), 2);
    }
}
