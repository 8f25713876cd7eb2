#![forbid(unsafe_code)]

use crate::domain::{Finding, Severity};
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A scanner output document, decoded by inspecting which discriminant key
/// is present at the top level. Unknown shapes are an explicit variant so
/// nothing falls through silently.
#[derive(Debug)]
pub enum ScanReport {
    /// Top-level `Results` array with nested `Vulnerabilities` lists.
    Trivy(Vec<TrivyResult>),
    /// Top-level flat `matches` array.
    Grype(Vec<GrypeMatch>),
    /// Neither known key present; carries the keys that were.
    Unknown(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    pub vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Deserialize)]
pub struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    pub vulnerability_id: String,
    #[serde(rename = "PkgName")]
    pub pkg_name: String,
    #[serde(rename = "InstalledVersion")]
    pub installed_version: String,
    #[serde(rename = "FixedVersion", default)]
    pub fixed_version: Option<String>,
    #[serde(rename = "Severity", default)]
    pub severity: String,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "References", default)]
    pub references: Vec<String>,
    #[serde(rename = "PublishedDate", default)]
    pub published_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct GrypeMatch {
    pub vulnerability: GrypeVulnerability,
    pub artifact: GrypeArtifact,
}

#[derive(Debug, Deserialize)]
pub struct GrypeVulnerability {
    pub id: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub fix: Option<GrypeFix>,
}

#[derive(Debug, Deserialize)]
pub struct GrypeFix {
    #[serde(default)]
    pub versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GrypeArtifact {
    pub name: String,
    pub version: String,
}

/// Decode a raw scanner output document into the tagged report shape.
pub fn parse_report(raw: &str) -> Result<ScanReport, Error> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| Error::ParseFailure(format!("scanner output is not JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::ParseFailure("scanner output is not a JSON object".into()))?;

    if let Some(results) = object.get("Results") {
        let results: Vec<TrivyResult> = serde_json::from_value(results.clone())
            .map_err(|err| Error::ParseFailure(format!("bad Results shape: {err}")))?;
        return Ok(ScanReport::Trivy(results));
    }
    if let Some(matches) = object.get("matches") {
        let matches: Vec<GrypeMatch> = serde_json::from_value(matches.clone())
            .map_err(|err| Error::ParseFailure(format!("bad matches shape: {err}")))?;
        return Ok(ScanReport::Grype(matches));
    }
    Ok(ScanReport::Unknown(object.keys().cloned().collect()))
}

/// Flatten a report into the normalized finding shape.
pub fn normalize(report: ScanReport) -> Result<Vec<Finding>, Error> {
    match report {
        ScanReport::Trivy(results) => Ok(results
            .into_iter()
            .flat_map(|result| result.vulnerabilities)
            .map(|vuln| Finding {
                finding_id: vuln.vulnerability_id,
                package: vuln.pkg_name,
                installed_version: vuln.installed_version,
                severity: Severity::parse(&vuln.severity),
                fixed_version: vuln.fixed_version.filter(|v| !v.is_empty()),
                description: vuln.description,
                references: vuln.references,
                published: vuln.published_date,
            })
            .collect()),
        ScanReport::Grype(matches) => Ok(matches
            .into_iter()
            .map(|m| Finding {
                finding_id: m.vulnerability.id,
                package: m.artifact.name,
                installed_version: m.artifact.version,
                severity: Severity::parse(&m.vulnerability.severity),
                fixed_version: m
                    .vulnerability
                    .fix
                    .and_then(|fix| fix.versions.into_iter().next()),
                description: m.vulnerability.description,
                references: m.vulnerability.urls,
                published: None,
            })
            .collect()),
        ScanReport::Unknown(keys) => Err(Error::ParseFailure(format!(
            "scanner output matched neither known shape (top-level keys: {})",
            keys.join(", ")
        ))),
    }
}
