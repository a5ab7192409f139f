//! On-disk mount configuration (spec §6: `config.json`). Modeled after the
//! serde-tagged config structs in `castore::composition`, collapsed to one
//! concrete struct since a mount links exactly one `BackingStore`
//! implementation rather than resolving one by name at runtime.

use std::path::{Path, PathBuf};

use edenfs_castore::CasePolicy;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// The currently checked-out root id, rendered via `BackingStore::render_root_id`.
    pub parent_root_id: String,
    #[serde(with = "case_policy_serde")]
    pub case_policy: CasePolicy,
    pub mount_path: PathBuf,
    pub overlay_dir: PathBuf,
    /// Journal memory budget in bytes (spec §4.7 `memory_limit`).
    pub journal_memory_limit_bytes: u64,
}

impl MountConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

mod case_policy_serde {
    use edenfs_castore::CasePolicy;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(policy: &CasePolicy, s: S) -> Result<S::Ok, S::Error> {
        let name = match policy {
            CasePolicy::Sensitive => "sensitive",
            CasePolicy::InsensitivePreserving => "insensitive-preserving",
        };
        s.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<CasePolicy, D::Error> {
        let name = String::deserialize(d)?;
        match name.as_str() {
            "sensitive" => Ok(CasePolicy::Sensitive),
            "insensitive-preserving" => Ok(CasePolicy::InsensitivePreserving),
            other => Err(serde::de::Error::custom(format!("unknown case policy {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = MountConfig {
            parent_root_id: "deadbeef".into(),
            case_policy: CasePolicy::InsensitivePreserving,
            mount_path: PathBuf::from("/home/user/repo"),
            overlay_dir: dir.path().join("overlay"),
            journal_memory_limit_bytes: 1 << 20,
        };
        config.save(&path).unwrap();
        let loaded = MountConfig::load(&path).unwrap();
        assert_eq!(loaded.parent_root_id, config.parent_root_id);
        assert_eq!(loaded.mount_path, config.mount_path);
    }
}
