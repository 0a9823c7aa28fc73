//! Update lifecycle: check the server, stream the new release into a sealed
//! staging artifact, verify it, and swap it in.
//!
//! ```text
//! Unknown -> Checking -> UpToDate
//!                     -> UpdateAvailable -> Downloading -> Verifying -> Installing -> UpToDate
//! any step -> Failed(kind)
//! ```
//!
//! The installed artifact and the version marker are only touched in
//! `Installing`, after the new artifact has been fully written and its
//! checksum confirmed. One cycle runs per application at a time.

use appvault_core::artifact::{ArtifactWriter, StagedArtifact};
use appvault_core::crypto::{KdfParams, SharedSecret};
use appvault_core::error::{FailureKind, Result, SyncError};
use appvault_core::fsutil::cleanup_staging;
use appvault_core::journal::ErrorOrigin;
use appvault_core::paths::validate_app_key;
use appvault_core::settings::AgentSettings;
use appvault_core::version::needs_update;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{ChunkStream, FileChunks, RemoteCatalog, RemoteManifest};
use crate::retry::RetryPolicy;
use crate::state::LocalState;

/// Staging files untouched for this long belong to no live writer.
const ORPHAN_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "failure", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Unknown,
    Checking,
    UpToDate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Installing,
    Failed(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    State { app: String, state: UpdateState },
    /// `total` is zero when the server did not announce a length.
    Progress { app: String, received: u64, total: u64 },
}

pub type EventSink<'a> = &'a (dyn Fn(UpdateEvent) + Send + Sync);

/// Sink for callers that do not observe progress.
pub fn ignore_events(_: UpdateEvent) {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Updated { from: Option<String>, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub local: Option<String>,
    pub manifest: RemoteManifest,
    pub update_available: bool,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kdf: KdfParams,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            kdf: settings.kdf,
            chunk_size: settings.chunk_size,
            retry: RetryPolicy::from_settings(&settings.retry),
        }
    }
}

pub struct UpdateEngine {
    catalog: Arc<dyn RemoteCatalog>,
    local: Arc<LocalState>,
    secret: SharedSecret,
    config: EngineConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<String, UpdateState>>,
}

impl UpdateEngine {
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        local: Arc<LocalState>,
        secret: SharedSecret,
        config: EngineConfig,
    ) -> Self {
        let removed = cleanup_staging(&local.layout.artifacts_dir(), ORPHAN_STAGING_AGE);
        if removed > 0 {
            info!(removed, "cleaned up interrupted installs");
        }
        Self {
            catalog,
            local,
            secret,
            config,
            locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, app_key: &str) -> UpdateState {
        self.states
            .lock()
            .get(app_key)
            .copied()
            .unwrap_or(UpdateState::Unknown)
    }

    /// Ask the server for the current release without downloading it.
    pub async fn check(&self, app_key: &str, cancel: &CancellationToken) -> Result<CheckReport> {
        validate_app_key(app_key)?;
        let lock = self.lock_for(app_key);
        let _guard = lock.lock().await;
        let events: EventSink<'_> = &ignore_events;
        self.set_state(app_key, UpdateState::Checking, events);
        match self.check_inner(app_key, cancel).await {
            Ok(report) => {
                let state = if report.update_available {
                    UpdateState::UpdateAvailable
                } else {
                    UpdateState::UpToDate
                };
                self.set_state(app_key, state, events);
                Ok(report)
            }
            Err(e) => {
                self.fail(app_key, &e, events);
                Err(e)
            }
        }
    }

    /// Run one full update cycle for `app_key`.
    pub async fn sync(
        &self,
        app_key: &str,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        validate_app_key(app_key)?;
        let lock = self.lock_for(app_key);
        let _guard = lock.lock().await;
        let result = self.run_cycle(app_key, events, cancel).await;
        match &result {
            Ok(_) => self.set_state(app_key, UpdateState::UpToDate, events),
            Err(e) => self.fail(app_key, e, events),
        }
        result
    }

    /// Sync every registered application concurrently.
    pub async fn sync_all(
        &self,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<UpdateOutcome>)> {
        let keys: Vec<String> = self
            .local
            .registry
            .list()
            .into_iter()
            .map(|r| r.key)
            .collect();
        let runs = keys.iter().map(|key| self.sync(key, events, cancel));
        let results = futures::future::join_all(runs).await;
        keys.into_iter().zip(results).collect()
    }

    /// Seal a local plaintext release and install it as `version`, for
    /// offline provisioning.
    pub async fn install_local(
        &self,
        app_key: &str,
        source: &Path,
        version: &str,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        validate_app_key(app_key)?;
        let lock = self.lock_for(app_key);
        let _guard = lock.lock().await;
        let result = self
            .install_local_inner(app_key, source, version, events, cancel)
            .await;
        match &result {
            Ok(_) => self.set_state(app_key, UpdateState::UpToDate, events),
            Err(e) => self.fail(app_key, e, events),
        }
        result
    }

    async fn install_local_inner(
        &self,
        app_key: &str,
        source: &Path,
        version: &str,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        let target = self.local.layout.artifact_path(app_key)?;
        let from = self.local.versions.read(app_key);
        self.set_state(app_key, UpdateState::Downloading, events);
        let total = tokio::fs::metadata(source).await.map(|m| m.len()).unwrap_or(0);
        let stream = FileChunks::open(source.to_path_buf()).await?;
        let (staged, _, _) = self
            .seal_stream(app_key, Box::new(stream), &target, total, events, cancel)
            .await?;
        self.commit(app_key, staged, &target, version, events)?;
        info!(app = app_key, %version, source = %source.display(), "local release installed");
        Ok(UpdateOutcome::Updated {
            from,
            to: version.to_string(),
        })
    }

    async fn run_cycle(
        &self,
        app_key: &str,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        self.set_state(app_key, UpdateState::Checking, events);
        let report = self.check_inner(app_key, cancel).await?;
        if !report.update_available {
            let version = report.local.unwrap_or(report.manifest.version);
            debug!(app = app_key, %version, "already current");
            return Ok(UpdateOutcome::UpToDate { version });
        }
        self.set_state(app_key, UpdateState::UpdateAvailable, events);

        let target = self.local.layout.artifact_path(app_key)?;
        let manifest = &report.manifest;
        let target_ref = target.as_path();
        let staged = self
            .config
            .retry
            .run("download", cancel, move |attempt| async move {
                debug!(app = app_key, attempt, "download attempt");
                self.download_once(app_key, manifest, target_ref, events, cancel)
                    .await
            })
            .await?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.commit(app_key, staged, &target, &manifest.version, events)?;
        info!(
            app = app_key,
            from = report.local.as_deref().unwrap_or("none"),
            to = %manifest.version,
            "update installed"
        );
        Ok(UpdateOutcome::Updated {
            from: report.local,
            to: manifest.version.clone(),
        })
    }

    async fn check_inner(&self, app_key: &str, cancel: &CancellationToken) -> Result<CheckReport> {
        let local = self.local.versions.read(app_key);
        let catalog = &self.catalog;
        let manifest = self
            .config
            .retry
            .run("manifest", cancel, move |_| async move {
                catalog.fetch_manifest(app_key).await
            })
            .await?;
        if let Err(e) = self
            .local
            .registry
            .record_remote_version(app_key, &manifest.version)
        {
            warn!(app = app_key, error = %e, "failed to record remote version");
        }
        let artifact_present = self.local.layout.artifact_path(app_key)?.is_file();
        let update_available =
            needs_update(local.as_deref(), &manifest.version) || !artifact_present;
        debug!(
            app = app_key,
            local = local.as_deref().unwrap_or("none"),
            remote = %manifest.version,
            artifact_present,
            update_available,
            "checked"
        );
        Ok(CheckReport {
            local,
            manifest,
            update_available,
        })
    }

    async fn download_once(
        &self,
        app_key: &str,
        manifest: &RemoteManifest,
        target: &Path,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact> {
        self.set_state(app_key, UpdateState::Downloading, events);
        let stream = self.catalog.fetch_artifact(manifest).await?;
        let (staged, digest, received) = self
            .seal_stream(app_key, stream, target, manifest.content_length, events, cancel)
            .await?;

        self.set_state(app_key, UpdateState::Verifying, events);
        if !digest.eq_ignore_ascii_case(&manifest.sha256) {
            return Err(SyncError::IntegrityMismatch {
                expected: manifest.sha256.to_ascii_lowercase(),
                actual: digest,
            });
        }
        if manifest.content_length > 0 && received != manifest.content_length {
            return Err(SyncError::IntegrityMismatch {
                expected: format!("{} bytes", manifest.content_length),
                actual: format!("{received} bytes"),
            });
        }
        Ok(staged)
    }

    /// Encrypt `stream` into a staging file next to `target`, hashing the
    /// plaintext on the way. Returns the staged artifact, the hex SHA-256 and
    /// the byte count.
    async fn seal_stream(
        &self,
        app_key: &str,
        mut stream: Box<dyn ChunkStream>,
        target: &Path,
        total: u64,
        events: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<(StagedArtifact, String, u64)> {
        let mut writer = self.open_writer(target.to_path_buf()).await?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        let batch_size = self.config.chunk_size.max(1);
        let mut pending = Vec::with_capacity(batch_size);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                next = stream.next_chunk() => next?,
            };
            let Some(chunk) = next else { break };
            hasher.update(&chunk);
            pending.extend_from_slice(&chunk);
            if pending.len() >= batch_size {
                let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                writer = seal_batch(writer, batch).await?;
            }
            received += chunk.len() as u64;
            events(UpdateEvent::Progress {
                app: app_key.to_string(),
                received,
                total,
            });
        }
        let staged = tokio::task::spawn_blocking(move || -> Result<StagedArtifact> {
            writer.write_chunk(&pending)?;
            writer.finish()
        })
        .await
        .map_err(|e| SyncError::Encryption(format!("writer task: {e}")))??;
        Ok((staged, hex::encode(hasher.finalize()), received))
    }

    /// Argon2 runs on the blocking pool.
    async fn open_writer(&self, target: PathBuf) -> Result<ArtifactWriter> {
        let secret = self.secret.clone();
        let kdf = self.config.kdf;
        let chunk_size = self.config.chunk_size;
        tokio::task::spawn_blocking(move || {
            ArtifactWriter::create(&target, &secret, &kdf, chunk_size)
        })
        .await
        .map_err(|e| SyncError::Encryption(format!("writer task: {e}")))?
    }

    fn commit(
        &self,
        app_key: &str,
        staged: StagedArtifact,
        target: &Path,
        version: &str,
        events: EventSink<'_>,
    ) -> Result<()> {
        self.set_state(app_key, UpdateState::Installing, events);
        let bytes = staged.plaintext_len();
        staged.install(target)?;
        self.local.versions.write(app_key, version)?;
        debug!(app = app_key, %version, bytes, "artifact committed");
        Ok(())
    }

    fn fail(&self, app_key: &str, err: &SyncError, events: EventSink<'_>) {
        if matches!(err, SyncError::Cancelled) {
            info!(app = app_key, "update cancelled");
            self.set_state(app_key, UpdateState::Unknown, events);
            return;
        }
        error!(app = app_key, error = %err, "update failed");
        self.set_state(app_key, UpdateState::Failed(err.kind()), events);
        if let Err(e) = self
            .local
            .journal
            .record(Some(app_key), ErrorOrigin::Update, err.to_string())
        {
            warn!(app = app_key, error = %e, "failed to journal update error");
        }
    }

    fn set_state(&self, app_key: &str, state: UpdateState, events: EventSink<'_>) {
        self.states.lock().insert(app_key.to_string(), state);
        debug!(app = app_key, ?state, "update state");
        events(UpdateEvent::State {
            app: app_key.to_string(),
            state,
        });
    }

    fn lock_for(&self, app_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(app_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Encryption and the staging write happen off the async workers.
async fn seal_batch(mut writer: ArtifactWriter, batch: Vec<u8>) -> Result<ArtifactWriter> {
    tokio::task::spawn_blocking(move || -> Result<ArtifactWriter> {
        writer.write_chunk(&batch)?;
        Ok(writer)
    })
    .await
    .map_err(|e| SyncError::Encryption(format!("writer task: {e}")))?
}
