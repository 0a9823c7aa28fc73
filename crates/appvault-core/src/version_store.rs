//! Persisted installed-version markers.
//!
//! `versions.json` holds a list of `{"applicationKey": .., "version": ..}`
//! records, one per installed application. The file is shared with whatever
//! loads client configuration, so reads tolerate damage and report "absent"
//! instead of failing; the engine then treats the application as not
//! installed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;
use crate::fsutil::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionMarker {
    pub application_key: String,
    pub version: String,
}

pub struct VersionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl VersionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn read(&self, app_key: &str) -> Option<String> {
        let data = match self.read_raw() {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "version markers unreadable");
                return None;
            }
        };
        match parse_markers(&data) {
            Ok(markers) => markers
                .into_iter()
                .rev()
                .find(|m| m.application_key == app_key)
                .map(|m| m.version),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "version markers corrupt");
                None
            }
        }
    }

    /// Durable before returning: the new list is fsynced and renamed over
    /// the old one. Writers are serialized so concurrent updates to different
    /// keys never drop each other. A file that cannot be read fails the write;
    /// only content that does not parse is replaced.
    pub fn write(&self, app_key: &str, version: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let data = self.read_raw()?;
        let mut markers = parse_markers(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "discarding corrupt version markers");
            Vec::new()
        });
        markers.retain(|m| m.application_key != app_key);
        markers.push(VersionMarker {
            application_key: app_key.to_string(),
            version: version.to_string(),
        });
        markers.sort_by(|a, b| a.application_key.cmp(&b.application_key));
        let data = serde_json::to_vec_pretty(&markers).map_err(io::Error::from)?;
        write_atomic(&self.path, &data)
    }

    fn read_raw(&self) -> io::Result<Vec<u8>> {
        match fs::read(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        }
    }
}

fn parse_markers(data: &[u8]) -> serde_json::Result<Vec<VersionMarker>> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(data)
}
