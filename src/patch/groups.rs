//! Patch group database
//!
//! Named groups of patch regions that can be enabled individually, stored
//! next to the program image as a versioned JSON document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{PatchRegion, PatchSnapshot};

/// Current on-disk format version
pub const GROUP_DB_VERSION: u32 = 1;

/// Name of the group every database starts with
pub const DEFAULT_GROUP: &str = "default";

/// Extension appended to the image path for the group database
pub const GROUP_DB_EXTENSION: &str = "dap.json";

#[derive(Error, Debug)]
pub enum GroupDbError {
    #[error("Unsupported patch database version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Patch database path {0} is not a file")]
    NotAFile(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed patch database: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchGroup {
    pub enabled: bool,
    #[serde(default)]
    pub regions: Vec<PatchRegion>,
}

impl PatchGroup {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            regions: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.regions.iter().map(PatchRegion::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchGroupDb {
    version: u32,
    groups: BTreeMap<String, PatchGroup>,
}

impl Default for PatchGroupDb {
    fn default() -> Self {
        let mut db = Self {
            version: GROUP_DB_VERSION,
            groups: BTreeMap::new(),
        };
        db.add(DEFAULT_GROUP, true);
        db
    }
}

impl PatchGroupDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<image>.dap.json` next to the program image
    pub fn path_for_image(image: &Path) -> PathBuf {
        image.with_extension(GROUP_DB_EXTENSION)
    }

    pub fn get(&self, name: &str) -> Option<&PatchGroup> {
        let group = self.groups.get(name);
        if group.is_none() {
            log::warn!("Requested group [{}] is not in group database.", name);
        }
        group
    }

    /// Add or reset a group
    pub fn add(&mut self, name: &str, enabled: bool) {
        self.groups.insert(name.to_string(), PatchGroup::new(enabled));
    }

    pub fn delete(&mut self, name: &str) -> bool {
        if self.groups.remove(name).is_some() {
            return true;
        }
        log::warn!(
            "Requested group [{}] not found in group database. Cannot delete.",
            name
        );
        false
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.groups.get_mut(name) {
            Some(group) => {
                group.enabled = enabled;
                true
            }
            None => {
                log::warn!("Requested group [{}] is not in group database.", name);
                false
            }
        }
    }

    /// Store the regions of `snapshot` as group `name`, creating it if needed
    pub fn capture_into(&mut self, name: &str, snapshot: &PatchSnapshot) {
        let group = self
            .groups
            .entry(name.to_string())
            .or_insert_with(|| PatchGroup::new(true));
        group.regions = snapshot.regions().to_vec();
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PatchGroup)> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Regions of all enabled groups, in group name order
    pub fn enabled_regions(&self) -> Vec<PatchRegion> {
        self.groups
            .values()
            .filter(|g| g.enabled)
            .flat_map(|g| g.regions.iter().cloned())
            .collect()
    }

    /// Read a database from disk
    pub fn read_from(path: &Path) -> Result<Self, GroupDbError> {
        if !path.is_file() {
            return Err(GroupDbError::NotAFile(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let db: Self = serde_json::from_str(&text)?;
        if db.version != GROUP_DB_VERSION {
            return Err(GroupDbError::Version {
                found: db.version,
                expected: GROUP_DB_VERSION,
            });
        }
        Ok(db)
    }

    /// Load from disk, falling back to a fresh database on any failure
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            log::info!("No patch database file found. Starting fresh database.");
            return Self::default();
        }
        match Self::read_from(path) {
            Ok(db) => {
                log::info!("Loaded patch database from: {}", path.display());
                db
            }
            Err(e) => {
                log::warn!("Error loading patch database.; details: {}", e);
                Self::default()
            }
        }
    }

    /// Write the database, replacing any previous file atomically
    pub fn save(&self, path: &Path) -> Result<(), GroupDbError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        log::info!("Saved patch database to: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> PatchSnapshot {
        PatchSnapshot::new(vec![
            PatchRegion::new(0x1000, vec![0xAA, 0xBB], vec![0x90, 0x90]).unwrap(),
            PatchRegion::new(0x2000, vec![0x74], vec![0xEB]).unwrap(),
        ])
    }

    #[test]
    fn test_default_group_exists() {
        let db = PatchGroupDb::new();
        assert!(db.get(DEFAULT_GROUP).is_some_and(|g| g.enabled));
        assert_eq!(db.names().collect::<Vec<_>>(), vec![DEFAULT_GROUP]);
    }

    #[test]
    fn test_add_delete_toggle() {
        let mut db = PatchGroupDb::new();
        db.add("nop-checks", false);
        assert!(db.set_enabled("nop-checks", true));
        assert!(!db.set_enabled("missing", true));
        assert!(db.delete("nop-checks"));
        assert!(!db.delete("nop-checks"));
    }

    #[test]
    fn test_enabled_regions_skip_disabled_groups() {
        let mut db = PatchGroupDb::new();
        db.capture_into("a", &sample_snapshot());
        db.capture_into("b", &sample_snapshot());
        db.set_enabled("b", false);
        assert_eq!(db.enabled_regions().len(), 2);
        assert_eq!(db.get("a").map(PatchGroup::total_bytes), Some(3));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.dap.json");

        let mut db = PatchGroupDb::new();
        db.capture_into(DEFAULT_GROUP, &sample_snapshot());
        db.save(&path).unwrap();

        assert_eq!(PatchGroupDb::load(&path), db);
    }

    #[test]
    fn test_wrong_version_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.dap.json");
        fs::write(&path, r#"{"version": 99, "groups": {}}"#).unwrap();

        assert!(matches!(
            PatchGroupDb::read_from(&path),
            Err(GroupDbError::Version { found: 99, .. })
        ));
        assert_eq!(PatchGroupDb::load(&path), PatchGroupDb::default());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.dap.json");
        fs::write(&path, b"\x1f\x8b not json").unwrap();
        assert_eq!(PatchGroupDb::load(&path), PatchGroupDb::default());
    }

    #[test]
    fn test_path_for_image() {
        let path = PatchGroupDb::path_for_image(Path::new("/bin/target.exe"));
        assert_eq!(path, PathBuf::from("/bin/target.dap.json"));
    }
}
