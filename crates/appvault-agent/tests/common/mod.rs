#![allow(dead_code)]

use appvault_agent::catalog::{AppListing, ChunkStream, RemoteCatalog, RemoteManifest};
use appvault_agent::engine::{EngineConfig, UpdateEngine};
use appvault_agent::retry::RetryPolicy;
use appvault_agent::state::LocalState;
use appvault_core::crypto::{KdfParams, SharedSecret};
use appvault_core::error::{Result, SyncError};
use appvault_core::paths::StorageLayout;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CHUNK: usize = 4 * 1024;

pub fn cheap_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

pub fn secret() -> SharedSecret {
    SharedSecret::new(b"field-office-secret".to_vec())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn local_state(root: &Path) -> Arc<LocalState> {
    let layout = StorageLayout::new(root.join("data")).with_ephemeral_dir(root.join("run"));
    Arc::new(LocalState::open(layout).unwrap())
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        kdf: cheap_kdf(),
        chunk_size: CHUNK,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    }
}

pub fn engine(catalog: Arc<FakeCatalog>, local: Arc<LocalState>) -> UpdateEngine {
    UpdateEngine::new(catalog, local, secret(), fast_config())
}

/// Deterministic payload that is not a multiple of the chunk size.
pub fn payload(version: &str, len: usize) -> Vec<u8> {
    let seed = version.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

struct Release {
    manifest: RemoteManifest,
    body: Vec<u8>,
}

/// In-memory distribution server with fault injection.
#[derive(Default)]
pub struct FakeCatalog {
    releases: Mutex<HashMap<String, Release>>,
    pub manifest_calls: AtomicU32,
    pub artifact_calls: AtomicU32,
    unreachable_manifests: AtomicU32,
    unreachable_downloads: AtomicU32,
    broken_streams: AtomicU32,
    break_after_chunks: AtomicU32,
    chunk_delay: Mutex<Option<Duration>>,
}

impl FakeCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, key: &str, version: &str, body: Vec<u8>) -> RemoteManifest {
        let manifest = RemoteManifest {
            version: version.to_string(),
            download_url: format!("/download/{key}_{version}.exe"),
            sha256: sha256_hex(&body),
            content_length: body.len() as u64,
        };
        self.releases.lock().insert(
            key.to_string(),
            Release {
                manifest: manifest.clone(),
                body,
            },
        );
        manifest
    }

    /// Serve `body` while announcing the checksum of `announced`.
    pub fn publish_mismatched(&self, key: &str, version: &str, announced: &[u8], body: Vec<u8>) {
        let manifest = RemoteManifest {
            version: version.to_string(),
            download_url: format!("/download/{key}_{version}.exe"),
            sha256: sha256_hex(announced),
            content_length: body.len() as u64,
        };
        self.releases
            .lock()
            .insert(key.to_string(), Release { manifest, body });
    }

    pub fn fail_manifests(&self, times: u32) {
        self.unreachable_manifests.store(times, Ordering::SeqCst);
    }

    pub fn fail_downloads(&self, times: u32) {
        self.unreachable_downloads.store(times, Ordering::SeqCst);
    }

    /// The next `times` downloads drop with `Unreachable` after serving
    /// `chunks` chunks.
    pub fn break_streams_after(&self, chunks: u32, times: u32) {
        self.break_after_chunks.store(chunks, Ordering::SeqCst);
        self.broken_streams.store(times, Ordering::SeqCst);
    }

    pub fn slow_chunks(&self, delay: Duration) {
        *self.chunk_delay.lock() = Some(delay);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn fetch_manifest(&self, app_key: &str) -> Result<RemoteManifest> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.unreachable_manifests) {
            return Err(SyncError::Unreachable("connection refused".into()));
        }
        self.releases
            .lock()
            .get(app_key)
            .map(|r| r.manifest.clone())
            .ok_or_else(|| SyncError::NotFound(app_key.to_string()))
    }

    async fn fetch_artifact(&self, manifest: &RemoteManifest) -> Result<Box<dyn ChunkStream>> {
        self.artifact_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.unreachable_downloads) {
            return Err(SyncError::Unreachable("connection reset".into()));
        }
        let body = self
            .releases
            .lock()
            .values()
            .find(|r| r.manifest.download_url == manifest.download_url)
            .map(|r| r.body.clone())
            .ok_or_else(|| SyncError::NotFound(manifest.download_url.clone()))?;
        let chunks = body
            .chunks(1000)
            .map(Bytes::copy_from_slice)
            .collect::<VecDeque<_>>();
        let break_after = Self::take_failure(&self.broken_streams)
            .then(|| self.break_after_chunks.load(Ordering::SeqCst) as usize);
        Ok(Box::new(VecChunks {
            chunks,
            delay: *self.chunk_delay.lock(),
            break_after,
        }))
    }

    async fn list_apps(&self) -> Result<Vec<AppListing>> {
        Ok(self
            .releases
            .lock()
            .keys()
            .map(|key| AppListing {
                key: key.clone(),
                display_name: None,
                entry_point: format!("{key}.exe"),
                icon: None,
            })
            .collect())
    }
}

struct VecChunks {
    chunks: VecDeque<Bytes>,
    delay: Option<Duration>,
    break_after: Option<usize>,
}

#[async_trait]
impl ChunkStream for VecChunks {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(left) = self.break_after.as_mut() {
            if *left == 0 {
                return Err(SyncError::Unreachable("connection reset mid-transfer".into()));
            }
            *left -= 1;
        }
        Ok(self.chunks.pop_front())
    }
}
