use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use orchestrator::ScannerKind;
use std::path::{Path, PathBuf};

/// snapscan-rs: scan backup snapshots for vulnerabilities
///
/// Publishes backup restore points as mounted disks on a scan host, runs a
/// vulnerability scanner over each mount, records the findings, and tears
/// the mounts down again.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/snapscan/config.toml` and `/etc/snapscan/config.d/*.toml`,
    /// where the latter being a glob pattern. If they don't exist, the
    /// default configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    /// Path of the SQLite database file, overriding the configuration.
    ///
    /// Empty string means findings are kept in memory for this run only.
    #[arg(short, long)]
    pub dbfile: Option<String>,

    /// Scan host the disks are published to.
    #[arg(long)]
    pub host: String,

    /// Username for the scan-host session.
    #[arg(short, long, default_value = "svc-snapscan")]
    pub username: String,

    /// Environment variable holding the scan-host secret.
    #[arg(long, default_value = "SNAPSCAN_HOST_SECRET")]
    pub credential_ref: String,

    /// Scanner to run: trivy or grype.
    #[arg(short, long, default_value = "trivy")]
    #[arg(value_parser = parse_scanner)]
    pub scanner: ScannerKind,

    /// Item to scan, as `name@restore-point:disk[,disk...]`. Repeatable.
    #[arg(short, long = "item", required = true)]
    #[arg(value_parser = parse_item)]
    pub items: Vec<ItemSpec>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

/// One `--item` argument, decomposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSpec {
    pub name: String,
    pub restore_point: String,
    pub disks: Vec<String>,
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[inline(always)]
fn parse_scanner(s: &str) -> Result<ScannerKind, String> {
    ScannerKind::parse(s).ok_or_else(|| format!("`{s}` is not a known scanner (trivy, grype)"))
}

/// Parse `name@restore-point:disk[,disk...]`.
fn parse_item(spec: &str) -> Result<ItemSpec, String> {
    let (name, rest) = spec
        .split_once('@')
        .ok_or_else(|| format!("`{spec}` is missing `@restore-point`"))?;
    let (restore_point, disks) = rest
        .split_once(':')
        .ok_or_else(|| format!("`{spec}` is missing `:disk[,disk...]`"))?;

    let disks: Vec<String> = disks
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();

    if name.is_empty() || restore_point.is_empty() || disks.is_empty() {
        return Err(format!(
            "`{spec}` must name an item, a restore point and at least one disk"
        ));
    }

    Ok(ItemSpec {
        name: name.to_string(),
        restore_point: restore_point.to_string(),
        disks,
    })
}
