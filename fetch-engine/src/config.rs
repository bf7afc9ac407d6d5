//! Engine configuration.
//!
//! Loads from a TOML file with per-field defaults; the CLI overrides the
//! pieces it cares about.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory completed files land in.
    pub download_root: PathBuf,

    /// Requested state file location. Falls back to the platform user-data
    /// directory when not writable.
    pub state_path: PathBuf,

    /// Base URL joined with entry names for manifest entries that carry
    /// only a digest.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum file tasks in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Tasks constructed per admission round.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per file before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Write buffer size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum partial size worth resuming, in bytes.
    #[serde(default = "default_resume_threshold")]
    pub resume_threshold: u64,

    /// Per-file progress debounce interval in milliseconds.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_max_concurrency() -> usize {
    50
}

fn default_batch_size() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_resume_threshold() -> u64 {
    crate::resume::DEFAULT_RESUME_THRESHOLD
}

fn default_progress_interval_ms() -> u64 {
    100
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            max_concurrency: default_max_concurrency(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: default_chunk_size(),
            resume_threshold: default_resume_threshold(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl EngineConfig {
    /// A configuration rooted at the given download directory, with the
    /// state file kept alongside it.
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        let download_root = download_root.into();
        let state_path = download_root.join("fetch-state.json");
        EngineConfig {
            download_root,
            state_path,
            base_url: None,
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
