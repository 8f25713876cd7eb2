#![forbid(unsafe_code)]

mod control_plane;
mod error;
mod persistence;
mod pool;
mod provision;
mod publish;
mod scan;

pub use control_plane::ControlPlane;
pub use error::Error;
pub use persistence::Persistence;
pub use pool::Pool;
pub use provision::Provision;
pub use publish::Publish;
pub use scan::Scan;

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub control_plane: ControlPlane,
    pub pool: Pool,
    pub publish: Publish,
    pub provision: Provision,
    pub scan: Scan,
    pub persistence: Persistence,
}

impl Config {
    /// Load configuration from a TOML file. Missing fields are filled with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml_edit::de::from_str(&text)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let toml = toml_edit::ser::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from multiple TOML files. Later files override earlier ones.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut merged = toml_edit::DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(path)?;
            let doc: toml_edit::DocumentMut = text.parse()?;
            merge_document(&mut merged, doc);
        }
        let config: Config = toml_edit::de::from_str(&merged.to_string())?;
        Ok(config)
    }
}

fn merge_document(target: &mut toml_edit::DocumentMut, source: toml_edit::DocumentMut) {
    for (key, item) in source.iter() {
        merge_item(
            target.entry(key).or_insert(toml_edit::Item::None),
            item.clone(),
        );
    }
}

fn merge_item(target: &mut toml_edit::Item, source: toml_edit::Item) {
    use toml_edit::Item;
    match (target, source) {
        (Item::Table(target_table), Item::Table(source_table)) => {
            for (key, item) in source_table.iter() {
                merge_item(target_table.entry(key).or_insert(Item::None), item.clone());
            }
        }
        (Item::ArrayOfTables(target_array), Item::ArrayOfTables(source_array)) => {
            for table in source_array.iter() {
                target_array.push(table.clone());
            }
        }
        (target_item, source_item) => {
            *target_item = source_item;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn load_multiple_merges() {
        let dir = tempdir().unwrap();
        let path1 = dir.path().join("a.toml");
        let path2 = dir.path().join("b.toml");

        std::fs::write(
            &path1,
            "[publish]\nverify_attempts = 7\n[pool]\nreconnect_attempts = 1\n",
        )
        .unwrap();
        std::fs::write(&path2, "[publish]\nverify_interval = 30\n").unwrap();

        let cfg = Config::load_multiple([path1, path2]).unwrap();
        assert_eq!(cfg.publish.verify_attempts, 7);
        assert_eq!(cfg.publish.verify_interval, Duration::from_secs(30));
        assert_eq!(cfg.pool.reconnect_attempts, 1);
        // untouched sections keep their defaults
        assert_eq!(cfg.scan.command_timeout, Duration::from_secs(900));
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.publish.verify_attempts, 5);
        assert_eq!(cfg.publish.initial_wait, Duration::from_secs(10));
        assert_eq!(cfg.pool.keepalive_interval, Duration::from_secs(60));
        assert!(cfg.provision.db_freshness_window >= Duration::from_secs(3600));
    }
}
