use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::artifact::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::crypto::{KdfParams, DEFAULT_CHUNK_SIZE};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSettings {
    pub server_url: String,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub kdf: KdfParams,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            request_timeout_secs: default_timeout(),
            retry: RetrySettings::default(),
            kdf: KdfParams::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl AgentSettings {
    /// Load `config.json` (defaults when absent), apply environment
    /// overrides, then validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut settings = if path.exists() {
            let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))?
        } else {
            Self::default()
        };
        if let Ok(url) = std::env::var("APPVAULT_SERVER_URL") {
            settings.server_url = url;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            bail!("server_url must be an http(s) URL");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        if !(1..=10).contains(&self.retry.max_attempts) {
            bail!("retry.max_attempts must be between 1 and 10");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            bail!("chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE}");
        }
        self.kdf.validate().context("kdf")?;
        Ok(())
    }
}
