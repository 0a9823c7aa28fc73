use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use crate::error::{Result, SyncError};

/// Prefix of every staging file; anything carrying it after a restart is an
/// orphan from an interrupted write.
pub const STAGING_PREFIX: &str = ".staging-";

/// Create a staging file next to `target` so the final rename never crosses
/// a filesystem boundary.
pub fn staging_file_for(target: &Path) -> Result<NamedTempFile> {
    let parent = target.parent().ok_or_else(|| {
        SyncError::Config(format!("no parent directory for {}", target.display()))
    })?;
    fs::create_dir_all(parent)?;
    Ok(tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent)?)
}

/// fsync the staged file, rename it over `target`, then fsync the directory
/// entry. A crash at any point leaves either the old or the new content.
pub fn commit_staged(staged: NamedTempFile, target: &Path) -> Result<()> {
    staged.as_file().sync_all()?;
    staged
        .persist(target)
        .map_err(|e| SyncError::StorageFailure(e.error))?;
    sync_parent_dir(target);
    Ok(())
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let mut staged = staging_file_for(target)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    commit_staged(staged, target)
}

fn sync_parent_dir(target: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = target.parent() {
            if let Ok(dir) = fs::OpenOptions::new().read(true).open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = target;
    }
}

/// Remove staging files in `dir` left by a crash. Files modified within
/// `min_age` may still belong to another process and are kept. Returns how
/// many were removed.
pub fn cleanup_staging(dir: &Path, min_age: Duration) -> usize {
    let mut removed = 0;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age >= min_age {
            tracing::warn!(path = %entry.path().display(), "removing orphaned staging file");
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("state.json");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn dropped_staging_file_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("state.json");
        write_atomic(&target, b"stable").unwrap();
        {
            let mut staged = staging_file_for(&target).unwrap();
            staged.write_all(b"half-written").unwrap();
        }
        assert_eq!(fs::read(&target).unwrap(), b"stable");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn orphans_are_swept() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".staging-abc.tmp"), b"junk").unwrap();
        fs::write(dir.path().join("keep.vault"), b"data").unwrap();
        assert_eq!(cleanup_staging(dir.path(), Duration::ZERO), 1);
        assert!(dir.path().join("keep.vault").exists());
    }

    #[test]
    fn recent_staging_files_survive_the_sweep() {
        let dir = tempdir().unwrap();
        let fresh = dir.path().join(".staging-live.tmp");
        let old = dir.path().join(".staging-dead.tmp");
        fs::write(&fresh, b"in flight").unwrap();
        fs::write(&old, b"junk").unwrap();
        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        assert_eq!(cleanup_staging(dir.path(), Duration::from_secs(60 * 60)), 1);
        assert!(fresh.exists());
        assert!(!old.exists());
    }
}
