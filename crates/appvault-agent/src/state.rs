use appvault_core::error::Result;
use appvault_core::journal::ErrorJournal;
use appvault_core::paths::StorageLayout;
use appvault_core::registry::{AppRegistry, ApplicationRecord};
use appvault_core::version_store::VersionStore;
use serde::Serialize;
use std::fs;

/// Everything the agent persists under its data directory.
pub struct LocalState {
    pub layout: StorageLayout,
    pub versions: VersionStore,
    pub registry: AppRegistry,
    pub journal: ErrorJournal,
}

/// What the UI shows for one application.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppStatus {
    #[serde(flatten)]
    pub record: ApplicationRecord,
    pub local_version: Option<String>,
    pub installed: bool,
}

impl LocalState {
    pub fn open(layout: StorageLayout) -> Result<Self> {
        fs::create_dir_all(layout.root())?;
        fs::create_dir_all(layout.artifacts_dir())?;
        if let Some(logs) = layout.journal_file().parent() {
            fs::create_dir_all(logs)?;
        }
        Ok(Self {
            versions: VersionStore::new(layout.versions_file()),
            registry: AppRegistry::new(layout.registry_file()),
            journal: ErrorJournal::new(layout.journal_file()),
            layout,
        })
    }

    pub fn status(&self) -> Vec<AppStatus> {
        self.registry
            .list()
            .into_iter()
            .map(|record| {
                let installed = self
                    .layout
                    .artifact_path(&record.key)
                    .map(|p| p.is_file())
                    .unwrap_or(false);
                AppStatus {
                    local_version: self.versions.read(&record.key),
                    installed,
                    record,
                }
            })
            .collect()
    }
}
