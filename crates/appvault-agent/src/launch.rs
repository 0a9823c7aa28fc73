//! Decrypt an installed artifact into a private, uniquely named executable,
//! run it, and remove the plaintext once the process is gone.

use appvault_core::artifact::ArtifactReader;
use appvault_core::crypto::SharedSecret;
use appvault_core::error::{Result, SyncError};
use appvault_core::journal::ErrorOrigin;
use appvault_core::paths::validate_app_key;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::LocalState;

/// Ephemeral binaries older than this are leftovers from a crashed agent.
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);
const SPAWN_RETRIES: u32 = 5;

pub struct LaunchSession {
    local: Arc<LocalState>,
    secret: SharedSecret,
}

impl LaunchSession {
    pub fn new(local: Arc<LocalState>, secret: SharedSecret) -> Self {
        let removed = sweep_stale(local.layout.ephemeral_dir(), STALE_AFTER);
        if removed > 0 {
            info!(removed, "removed stale ephemeral binaries");
        }
        Self { local, secret }
    }

    /// Decrypt and start `app_key`. Failures are journaled before they are
    /// returned.
    pub async fn launch(&self, app_key: &str, args: &[String]) -> Result<ProcessHandle> {
        match self.launch_inner(app_key, args).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                error!(app = app_key, error = %e, "launch failed");
                if let Err(je) =
                    self.local
                        .journal
                        .record(Some(app_key), ErrorOrigin::Launch, e.to_string())
                {
                    warn!(app = app_key, error = %je, "failed to journal launch error");
                }
                Err(e)
            }
        }
    }

    async fn launch_inner(&self, app_key: &str, args: &[String]) -> Result<ProcessHandle> {
        validate_app_key(app_key)?;
        let artifact = self.local.layout.artifact_path(app_key)?;
        if !artifact.is_file() {
            return Err(SyncError::NotInstalled(app_key.to_string()));
        }
        let entry_point = self
            .local
            .registry
            .get(app_key)
            .map(|r| r.entry_point)
            .unwrap_or_else(|| app_key.to_string());
        let dir = self.local.layout.ephemeral_dir().to_path_buf();
        let secret = self.secret.clone();
        let key = app_key.to_string();
        let ephemeral = tokio::task::spawn_blocking(move || {
            materialize(&key, &artifact, &dir, &entry_point, &secret)
        })
        .await
        .map_err(|e| SyncError::LaunchFailed(format!("decrypt task: {e}")))??;

        let mut command = Command::new(&*ephemeral);
        command.args(args).kill_on_drop(true);
        let child = spawn_with_retry(&mut command).await.map_err(|e| {
            SyncError::LaunchFailed(format!("spawn {}: {e}", ephemeral.display()))
        })?;
        info!(
            app = app_key,
            pid = child.id().unwrap_or_default(),
            path = %ephemeral.display(),
            "application started"
        );
        Ok(ProcessHandle {
            app: app_key.to_string(),
            child,
            ephemeral,
        })
    }
}

/// A running application. Dropping the handle kills the process and removes
/// its ephemeral binary.
#[derive(Debug)]
pub struct ProcessHandle {
    app: String,
    child: Child,
    ephemeral: TempPath,
}

impl ProcessHandle {
    pub fn ephemeral_path(&self) -> &Path {
        &self.ephemeral
    }

    pub async fn wait(self) -> Result<ExitStatus> {
        let ProcessHandle {
            app,
            mut child,
            ephemeral,
        } = self;
        let status = child.wait().await;
        finish(&app, ephemeral, status)
    }

    /// Wait for exit, killing the process if `cancel` fires first.
    pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> Result<ExitStatus> {
        let ProcessHandle {
            app,
            mut child,
            ephemeral,
        } = self;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                info!(app = %app, "stopping application");
                if let Err(e) = child.start_kill() {
                    warn!(app = %app, error = %e, "kill failed");
                }
                child.wait().await
            }
        };
        finish(&app, ephemeral, status)
    }
}

fn finish(app: &str, ephemeral: TempPath, status: std::io::Result<ExitStatus>) -> Result<ExitStatus> {
    let path = ephemeral.to_path_buf();
    if let Err(e) = ephemeral.close() {
        warn!(app, path = %path.display(), error = %e, "failed to remove ephemeral binary");
    } else {
        debug!(app, path = %path.display(), "ephemeral binary removed");
    }
    let status = status.map_err(|e| SyncError::LaunchFailed(format!("wait: {e}")))?;
    info!(app, code = ?status.code(), "application exited");
    Ok(status)
}

/// Decrypt `artifact` into a fresh owner-only file under `dir`. The file is
/// removed again if decryption fails part way.
fn materialize(
    app_key: &str,
    artifact: &Path,
    dir: &Path,
    entry_point: &str,
    secret: &SharedSecret,
) -> Result<TempPath> {
    ensure_private_dir(dir)?;
    let (stem, suffix) = ephemeral_name_parts(entry_point);
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{stem}-"))
        .suffix(&suffix)
        .tempfile_in(dir)?;

    let corrupt = |e: SyncError| match e {
        SyncError::AuthenticationFailure => SyncError::CorruptInstall {
            app: app_key.to_string(),
        },
        other => other,
    };
    let reader = ArtifactReader::open(artifact).map_err(corrupt)?;
    {
        let mut out = BufWriter::new(file.as_file_mut());
        reader.decrypt_to(secret, &mut out).map_err(corrupt)?;
        out.flush()?;
    }
    file.as_file().sync_all()?;
    set_executable(file.path())?;
    Ok(file.into_temp_path())
}

/// `WorkForce_` style prefixes lose their trailing separator; a missing
/// extension becomes `.exe` on Windows.
fn ephemeral_name_parts(entry_point: &str) -> (String, String) {
    let name = Path::new(entry_point)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.trim_end_matches(['_', '-', '.']);
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.to_string(), String::new()),
    };
    let stem = if stem.is_empty() { "app".to_string() } else { stem };
    let ext = if ext.is_empty() && cfg!(windows) {
        ".exe".to_string()
    } else {
        ext
    };
    (stem, ext)
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Another thread forking while our write handle was still open can leave
/// the binary briefly busy on Linux.
async fn spawn_with_retry(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Err(e) if is_text_busy(&e) && attempt < SPAWN_RETRIES => {
                attempt += 1;
                debug!(attempt, "executable busy, retrying spawn");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

#[cfg(unix)]
fn is_text_busy(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_: &std::io::Error) -> bool {
    false
}

/// Remove files in `dir` not modified within `max_age`.
pub fn sweep_stale(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age >= max_age {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale binary"),
            }
        }
    }
    removed
}
