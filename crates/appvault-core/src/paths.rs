use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "appvault";

pub const ARTIFACT_EXTENSION: &str = "vault";
const MAX_APP_KEY_LEN: usize = 64;

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("APPVAULT_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Application keys become file names, so they are restricted to a safe
/// alphabet and may not start with a dot.
pub fn validate_app_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key.len() <= MAX_APP_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(SyncError::InvalidAppKey(key.to_string()))
    }
}

/// Where everything lives under one data directory. Launch copies default to
/// `run/` inside it.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    ephemeral_root: PathBuf,
}

impl StorageLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ephemeral_root: root.as_ref().join("run"),
        }
    }

    pub fn with_ephemeral_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.ephemeral_root = dir.as_ref().to_path_buf();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn artifact_path(&self, app_key: &str) -> Result<PathBuf> {
        validate_app_key(app_key)?;
        Ok(self
            .artifacts_dir()
            .join(format!("{app_key}.{ARTIFACT_EXTENSION}")))
    }

    pub fn versions_file(&self) -> PathBuf {
        self.root.join("versions.json")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("apps.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.root.join("logs").join("errors.jsonl")
    }

    pub fn ephemeral_dir(&self) -> &Path {
        &self.ephemeral_root
    }
}
