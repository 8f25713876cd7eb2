#![forbid(unsafe_code)]

mod repo;

pub use repo::{NoopVulnStore, SqliteVulnStore, StoredVulnerability, VulnStore};
