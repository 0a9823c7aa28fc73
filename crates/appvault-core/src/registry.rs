use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::fsutil::write_atomic;
use crate::paths::validate_app_key;

/// A managed application. The installed version lives in the version store
/// and the encrypted artifact path follows from the storage layout; only the
/// identity, presentation fields and the last seen remote version are kept
/// here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationRecord {
    pub key: String,
    pub display_name: String,
    /// File name the decrypted binary is given when launched.
    pub entry_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub remote_version: Option<String>,
}

impl ApplicationRecord {
    pub fn new(key: &str, display_name: &str, entry_point: &str) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            entry_point: entry_point.to_string(),
            icon: None,
            remote_version: None,
        }
    }
}

pub struct AppRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AppRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Vec<ApplicationRecord> {
        let data = match self.read_raw() {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "application registry unreadable");
                return Vec::new();
            }
        };
        parse_records(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "application registry corrupt");
            Vec::new()
        })
    }

    pub fn get(&self, key: &str) -> Option<ApplicationRecord> {
        self.list().into_iter().find(|r| r.key == key)
    }

    /// Insert a new application or refresh the presentation fields of a known
    /// one. The last seen remote version is never touched here.
    pub fn register(&self, record: ApplicationRecord) -> Result<bool> {
        validate_app_key(&record.key)?;
        self.modify(|records| {
            if let Some(existing) = records.iter_mut().find(|r| r.key == record.key) {
                existing.display_name = record.display_name;
                existing.entry_point = record.entry_point;
                if record.icon.is_some() {
                    existing.icon = record.icon;
                }
                false
            } else {
                info!(app = %record.key, "application registered");
                records.push(record);
                true
            }
        })
    }

    pub fn record_remote_version(&self, key: &str, version: &str) -> Result<()> {
        self.modify(|records| {
            if let Some(existing) = records.iter_mut().find(|r| r.key == key) {
                existing.remote_version = Some(version.to_string());
            }
        })
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Vec<ApplicationRecord>) -> T) -> Result<T> {
        let _guard = self.lock.lock();
        let data = self.read_raw()?;
        let mut records = parse_records(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "rebuilding corrupt registry");
            Vec::new()
        });
        let out = f(&mut records);
        let data = serde_json::to_vec_pretty(&records).map_err(io::Error::from)?;
        write_atomic(&self.path, &data)?;
        Ok(out)
    }

    fn read_raw(&self) -> io::Result<Vec<u8>> {
        match fs::read(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        }
    }
}

fn parse_records(data: &[u8]) -> serde_json::Result<Vec<ApplicationRecord>> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use tempfile::tempdir;

    #[test]
    fn register_is_idempotent_and_keeps_remote_version() {
        let dir = tempdir().unwrap();
        let registry = AppRegistry::new(dir.path().join("apps.json"));
        assert!(registry
            .register(ApplicationRecord::new("WorkForce", "WorkForce", "WorkForce.exe"))
            .unwrap());
        registry.record_remote_version("WorkForce", "1.4").unwrap();

        let mut renamed = ApplicationRecord::new("WorkForce", "Work Force", "WorkForce.exe");
        renamed.remote_version = Some("9.9".into());
        assert!(!registry.register(renamed).unwrap());

        let record = registry.get("WorkForce").unwrap();
        assert_eq!(record.display_name, "Work Force");
        assert_eq!(record.remote_version.as_deref(), Some("1.4"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn rejects_unsafe_keys() {
        let dir = tempdir().unwrap();
        let registry = AppRegistry::new(dir.path().join("apps.json"));
        assert!(registry
            .register(ApplicationRecord::new("../x", "x", "x"))
            .is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn corrupt_registry_is_rebuilt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apps.json");
        fs::write(&path, b"[{\"key\":").unwrap();
        let registry = AppRegistry::new(&path);
        assert!(registry.list().is_empty());
        registry
            .register(ApplicationRecord::new("pm", "pm", "pm.exe"))
            .unwrap();
        assert_eq!(registry.list().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_registry_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apps.json");
        std::os::unix::fs::symlink("apps.json", &path).unwrap();
        let registry = AppRegistry::new(&path);

        let err = registry
            .register(ApplicationRecord::new("pm", "pm", "pm.exe"))
            .unwrap_err();
        assert!(matches!(err, SyncError::StorageFailure(_)), "{err}");
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
    }

    #[test]
    fn remote_version_for_unknown_app_is_ignored() {
        let dir = tempdir().unwrap();
        let registry = AppRegistry::new(dir.path().join("apps.json"));
        registry.record_remote_version("ghost", "1.0").unwrap();
        assert!(registry.get("ghost").is_none());
    }
}
