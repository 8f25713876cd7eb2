#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Scanner output uses free-form severity strings; anything
    /// unrecognized is treated as negligible rather than dropped.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Negligible,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Negligible => "negligible",
        };
        f.write_str(s)
    }
}

/// Triage status of a finding. Only ever mutated by explicit user action,
/// never by scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnStatus {
    #[default]
    Pending,
    InReview,
    Confirmed,
    FalsePositive,
    Fixed,
    WontFix,
}

impl VulnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VulnStatus::Pending => "pending",
            VulnStatus::InReview => "in_review",
            VulnStatus::Confirmed => "confirmed",
            VulnStatus::FalsePositive => "false_positive",
            VulnStatus::Fixed => "fixed",
            VulnStatus::WontFix => "wont_fix",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => VulnStatus::Pending,
            "in_review" => VulnStatus::InReview,
            "confirmed" => VulnStatus::Confirmed,
            "false_positive" => VulnStatus::FalsePositive,
            "fixed" => VulnStatus::Fixed,
            "wont_fix" => VulnStatus::WontFix,
            _ => return None,
        })
    }
}

/// Normalized finding produced by parsing scanner output. The unique key is
/// (finding_id, package, installed_version, item_name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub package: String,
    pub installed_version: String,
    pub severity: Severity,
    pub fixed_version: Option<String>,
    pub description: Option<String>,
    pub references: Vec<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Count of findings per severity, reported per scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub negligible: u32,
}

impl SeverityCounts {
    pub fn tally<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            match finding.severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
                Severity::Negligible => counts.negligible += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low + self.negligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parse_is_lenient() {
        assert_eq!(Severity::parse("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse("Moderate"), Severity::Medium);
        assert_eq!(Severity::parse("Unknown"), Severity::Negligible);
        assert_eq!(Severity::parse(""), Severity::Negligible);
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            VulnStatus::Pending,
            VulnStatus::InReview,
            VulnStatus::Confirmed,
            VulnStatus::FalsePositive,
            VulnStatus::Fixed,
            VulnStatus::WontFix,
        ] {
            assert_eq!(VulnStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VulnStatus::parse("nope"), None);
    }
}
