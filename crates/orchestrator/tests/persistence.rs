use chrono::{Duration as ChronoDuration, Utc};
use orchestrator::persistence::{SqliteVulnStore, VulnStore};
use orchestrator::{
    Finding, HostId, MountPoint, MountStatus, ScanRecord, ScannerKind, Severity, SeverityCounts,
    VulnStatus,
};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

fn finding(id: &str, severity: Severity) -> Finding {
    Finding {
        finding_id: id.to_string(),
        package: "openssl".to_string(),
        installed_version: "1.1.1k".to_string(),
        severity,
        fixed_version: Some("1.1.1l".to_string()),
        description: Some("overflow".to_string()),
        references: vec!["https://example.org/cve".to_string()],
        published: None,
    }
}

async fn store_with_scan() -> (SqliteVulnStore, i64) {
    let store = SqliteVulnStore::in_memory().await.unwrap();
    let record = ScanRecord::started(HostId::new("scanhost-1"), "vm-web-01", ScannerKind::Trivy);
    let scan_id = store.record_scan_started(&record).await.unwrap();
    (store, scan_id)
}

#[tokio::test]
async fn rescan_preserves_first_discovered_and_advances_last_seen() {
    let (store, scan_1) = store_with_scan().await;
    let t1 = Utc::now() - ChronoDuration::days(7);
    let t2 = Utc::now();

    store
        .upsert_findings(scan_1, "vm-web-01", &[finding("CVE-2023-1234", Severity::High)], t1, &HashSet::new())
        .await
        .unwrap();

    let first = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap()
        .expect("row exists");
    assert_eq!(first.first_discovered, t1);
    assert_eq!(first.last_seen, t1);
    assert_eq!(first.status, VulnStatus::Pending);
    assert_eq!(store.history_count(first.id).await.unwrap(), 1);

    // the severity was re-rated upstream; identity is unchanged
    let record = ScanRecord::started(HostId::new("scanhost-1"), "vm-web-01", ScannerKind::Trivy);
    let scan_2 = store.record_scan_started(&record).await.unwrap();
    store
        .upsert_findings(scan_2, "vm-web-01", &[finding("CVE-2023-1234", Severity::Critical)], t2, &HashSet::new())
        .await
        .unwrap();

    let second = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap()
        .expect("still one row");
    assert_eq!(second.id, first.id);
    assert_eq!(second.first_discovered, t1);
    assert_eq!(second.last_seen, t2);
    assert_eq!(second.severity, Severity::Critical);
    // exactly one history row per sighting, append-only
    assert_eq!(store.history_count(first.id).await.unwrap(), 2);
}

#[tokio::test]
async fn known_exploited_flag_is_sticky() {
    let (store, scan_id) = store_with_scan().await;
    let kev: HashSet<String> = ["CVE-2023-1234".to_string()].into();

    store
        .upsert_findings(scan_id, "vm-web-01", &[finding("CVE-2023-1234", Severity::High)], Utc::now(), &kev)
        .await
        .unwrap();
    let stored = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.known_exploited);

    // a later batch without a reachable feed must not clear the flag
    store
        .upsert_findings(scan_id, "vm-web-01", &[finding("CVE-2023-1234", Severity::High)], Utc::now(), &HashSet::new())
        .await
        .unwrap();
    let stored = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.known_exploited);
}

#[tokio::test]
async fn changed_installed_version_is_a_distinct_row() {
    let (store, scan_id) = store_with_scan().await;

    let mut upgraded = finding("CVE-2023-1234", Severity::High);
    upgraded.installed_version = "1.1.1l".to_string();
    store
        .upsert_findings(
            scan_id,
            "vm-web-01",
            &[finding("CVE-2023-1234", Severity::High), upgraded],
            Utc::now(),
            &HashSet::new(),
        )
        .await
        .unwrap();

    let old = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap()
        .unwrap();
    let new = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1l", "vm-web-01")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(old.id, new.id);
}

#[tokio::test]
async fn same_finding_on_two_items_is_tracked_separately() {
    let (store, scan_id) = store_with_scan().await;

    store
        .upsert_findings(scan_id, "vm-web-01", &[finding("CVE-2023-1234", Severity::High)], Utc::now(), &HashSet::new())
        .await
        .unwrap();
    store
        .upsert_findings(scan_id, "vm-db-02", &[finding("CVE-2023-1234", Severity::High)], Utc::now(), &HashSet::new())
        .await
        .unwrap();

    let web = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap()
        .unwrap();
    let db = store
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-db-02")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(web.id, db.id);
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("snapscan.db");

    {
        let store = SqliteVulnStore::open(path.clone()).await.unwrap();
        let record =
            ScanRecord::started(HostId::new("scanhost-1"), "vm-web-01", ScannerKind::Trivy);
        let scan_id = store.record_scan_started(&record).await.unwrap();
        store
            .upsert_findings(scan_id, "vm-web-01", &[finding("CVE-2023-1234", Severity::High)], Utc::now(), &HashSet::new())
            .await
            .unwrap();
    }

    let reopened = SqliteVulnStore::open(path).await.unwrap();
    let stored = reopened
        .find_vulnerability("CVE-2023-1234", "openssl", "1.1.1k", "vm-web-01")
        .await
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn scan_mount_and_session_rows_round_trip() {
    let (store, scan_id) = store_with_scan().await;
    let host = HostId::new("scanhost-1");

    let mut record = ScanRecord::started(host.clone(), "vm-web-01", ScannerKind::Trivy);
    record.complete(
        SeverityCounts {
            high: 2,
            ..SeverityCounts::default()
        },
        Duration::from_secs(90),
    );
    store.finalize_scan(scan_id, &record).await.unwrap();

    let mount = MountPoint {
        host: host.clone(),
        device: "disk0".to_string(),
        path: "/tmp/snapscan.mount/sess-1/disk0".into(),
        fs_type: "auto".to_string(),
        options: None,
        status: MountStatus::Mounted,
    };
    store.record_mount(&mount).await.unwrap();
    store
        .set_mount_status(&host, Path::new("/tmp/snapscan.mount/sess-1/disk0"), MountStatus::Unmounted)
        .await
        .unwrap();

    store.set_session_status(&host, true).await.unwrap();
    store.set_session_status(&host, false).await.unwrap();
}
