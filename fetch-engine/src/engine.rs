//! Embedder-facing engine facade.
//!
//! The engine binds the state store, transport, verifier and coordinator
//! into one value whose lifecycle the embedder owns. Callbacks are invoked
//! on the engine's executor and must not block.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compression;
use crate::config::EngineConfig;
use crate::coordinator::{self, RunCounters, RunSummary};
use crate::error::{EngineError, Result, StateError};
use crate::manifest::Manifest;
use crate::progress::{Callbacks, LogCallback, ProgressCallback};
use crate::state::record::Status;
use crate::state::{MergeDiff, StateStore};
use crate::task::TaskContext;
use crate::transport::{DefaultTransport, Transport, TransportStats, WorkloadShape};
use crate::verify::Verifier;

/// Application name used for the platform user-data fallback directory.
const APP_NAME: &str = "fetch-engine";

/// Per-state record counts, for display.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub verify_failed: usize,
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub states: StateCounts,
    /// Wire bytes received across runs of this engine.
    pub raw_bytes: u64,
    /// Decoded bytes written across runs of this engine.
    pub decoded_bytes: u64,
    /// Decoded-to-raw ratio; 1.0 means no compression savings.
    pub compression_ratio: f64,
    pub transport: TransportStats,
    /// Wall-clock duration of the last completed run.
    pub elapsed: Duration,
}

/// The bulk-download engine.
pub struct Engine {
    config: EngineConfig,
    root: RwLock<PathBuf>,
    store: Arc<StateStore>,
    verifier: Arc<Verifier>,
    callbacks: RwLock<Callbacks>,
    selection: RwLock<Vec<String>>,
    cancel: Mutex<CancellationToken>,
    counters: Arc<RunCounters>,
    transport: RwLock<Option<Arc<DefaultTransport>>>,
    last_run: RwLock<Option<RunSummary>>,
}

impl Engine {
    /// Construct an engine. Prior state is loaded and healed; a corrupt
    /// state file is reported and replaced with an empty record set, but a
    /// state file from a newer version refuses to load.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let root = config.download_root.clone();
        let store = match StateStore::open(&config.state_path, &root, APP_NAME) {
            Ok(store) => store,
            Err(StateError::Corrupt(e)) => {
                warn!("state file corrupt ({e}); proceeding with empty state");
                StateStore::discarding(&config.state_path, APP_NAME)
            }
            Err(e) => return Err(e.into()),
        };
        info!("state file: {}", store.path().display());

        Ok(Engine {
            root: RwLock::new(root),
            store: Arc::new(store),
            verifier: Arc::new(Verifier::new()),
            callbacks: RwLock::new(Callbacks::default()),
            selection: RwLock::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            counters: Arc::new(RunCounters::default()),
            transport: RwLock::new(None),
            last_run: RwLock::new(None),
            config,
        })
    }

    /// Load a manifest file and reconcile it with prior state. `.part`
    /// files of entries whose identity changed are cleared.
    pub fn load_manifest_file(&self, path: &Path, prune: bool) -> Result<MergeDiff> {
        let manifest = Manifest::load(path, self.config.base_url.as_deref())?;
        self.apply_manifest(&manifest, prune)
    }

    /// Same as [`Engine::load_manifest_file`], from an in-memory document.
    pub fn load_manifest_str(&self, json: &str, prune: bool) -> Result<MergeDiff> {
        let manifest = Manifest::parse(json, self.config.base_url.as_deref())?;
        self.apply_manifest(&manifest, prune)
    }

    fn apply_manifest(&self, manifest: &Manifest, prune: bool) -> Result<MergeDiff> {
        let diff = self.store.merge(manifest, prune);
        info!(
            "manifest merged: {} added, {} updated, {} preserved, {} removed",
            diff.added.len(),
            diff.updated.len(),
            diff.preserved.len(),
            diff.removed.len()
        );

        // A changed identity invalidates any partial bytes on disk.
        let root = self.root.read().unwrap().clone();
        for name in &diff.updated {
            if let Some(rec) = self.store.get(name) {
                let _ = std::fs::remove_file(rec.part_path(&root));
            }
        }
        Ok(diff)
    }

    /// Change the directory completed files land in.
    pub fn set_download_root(&self, root: impl Into<PathBuf>) {
        *self.root.write().unwrap() = root.into();
    }

    /// Choose the records the next run will fetch.
    pub fn select<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.selection.write().unwrap() = names.into_iter().map(Into::into).collect();
    }

    /// Select every known record.
    pub fn select_all(&self) {
        let names = self.store.snapshot().into_iter().map(|r| r.name).collect();
        *self.selection.write().unwrap() = names;
    }

    /// Register the observer callbacks. They run on the executor and must
    /// not block.
    pub fn subscribe(&self, progress: Option<ProgressCallback>, log: Option<LogCallback>) {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.progress = progress;
        callbacks.log = log;
    }

    /// Run the current selection to completion. Returns after all tasks
    /// reach a terminal state or, on cancellation, after the graceful
    /// drain finishes.
    pub async fn start(&self) -> Result<RunSummary> {
        let selection = {
            let sel = self.selection.read().unwrap();
            if sel.is_empty() {
                self.store.snapshot().into_iter().map(|r| r.name).collect()
            } else {
                sel.clone()
            }
        };

        // Size the pool and timeouts from what this run intends to fetch.
        let shape = self.workload_shape(&selection);
        let transport = Arc::new(DefaultTransport::new(&shape)?);
        *self.transport.write().unwrap() = Some(transport.clone());

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let callbacks = self.callbacks.read().unwrap().clone();

        // Coalesced checkpoints run beside the tasks; a final checkpoint
        // lands when the loop is told to stop.
        let checkpoint_cancel = CancellationToken::new();
        let checkpoint_handle = {
            let store = self.store.clone();
            let token = checkpoint_cancel.clone();
            let cb = callbacks.clone();
            tokio::spawn(async move { store.run_checkpoints(token, cb).await })
        };

        let ctx = TaskContext {
            store: self.store.clone(),
            transport,
            verifier: self.verifier.clone(),
            root: self.root.read().unwrap().clone(),
            retry: self.config.retry.clone(),
            transfer: self.config.transfer.clone(),
            cancel,
            callbacks,
            counters: self.counters.clone(),
        };

        let summary = coordinator::run(ctx, &self.config.concurrency, selection).await;

        checkpoint_cancel.cancel();
        if checkpoint_handle.await.is_err() {
            warn!("checkpoint task aborted");
        }

        *self.last_run.write().unwrap() = Some(summary.clone());
        Ok(summary)
    }

    fn workload_shape(&self, selection: &[String]) -> WorkloadShape {
        let mut total = 0u64;
        for name in selection {
            if let Some(rec) = self.store.get(name) {
                total += rec.size_hint().unwrap_or(0);
            }
        }
        WorkloadShape {
            entry_count: selection.len(),
            total_expected_bytes: total,
        }
    }

    /// Request cooperative cancellation of the current run. Non-blocking;
    /// `start()` returns once in-flight tasks have drained.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Read-only statistics snapshot.
    pub fn statistics(&self) -> EngineStats {
        let mut states = StateCounts::default();
        for rec in self.store.snapshot() {
            match rec.status {
                Status::Pending => states.pending += 1,
                Status::InProgress => states.in_progress += 1,
                Status::Completed => states.completed += 1,
                Status::Failed => states.failed += 1,
                Status::Skipped => states.skipped += 1,
                Status::VerifyFailed => states.verify_failed += 1,
            }
        }

        let raw = self.counters.raw();
        let decoded = self.counters.decoded();
        let transport = self
            .transport
            .read()
            .unwrap()
            .as_ref()
            .map(|t| t.stats())
            .unwrap_or_default();
        let elapsed = self
            .last_run
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.elapsed)
            .unwrap_or_default();

        EngineStats {
            states,
            raw_bytes: raw,
            decoded_bytes: decoded,
            compression_ratio: compression::compression_ratio(raw, decoded),
            transport,
            elapsed,
        }
    }

    /// Path the state store actually persists to, after fallback.
    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    /// Snapshot of all records, for display.
    pub fn records(&self) -> Vec<crate::state::record::ProgressRecord> {
        self.store.snapshot()
    }

    /// Cancel any running work, write a final checkpoint, and shut the
    /// transport pools down.
    pub async fn close(&self) -> Result<()> {
        self.cancel();
        if let Err(e) = self.store.checkpoint().await {
            warn!("final checkpoint on close failed: {e}");
            return Err(EngineError::State(e));
        }
        let transport = self.transport.write().unwrap().take();
        if let Some(t) = transport {
            t.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_in(dir: &Path) -> Engine {
        let mut config = EngineConfig::new(dir);
        config.base_url = Some("http://cdn.test".to_string());
        Engine::new(config).unwrap()
    }

    #[test]
    fn test_manifest_merge_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        let diff = engine
            .load_manifest_str(r#"{"a.json": "d41d8cd98f00b204e9800998ecf8427e"}"#, false)
            .unwrap();
        assert_eq!(diff.added, vec!["a.json"]);

        let stats = engine.statistics();
        assert_eq!(stats.states.pending, 1);
    }

    #[test]
    fn test_updated_entry_clears_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        engine
            .load_manifest_str(r#"{"a.bin": "d41d8cd98f00b204e9800998ecf8427e"}"#, false)
            .unwrap();
        let part = dir.path().join("a.bin.part");
        std::fs::write(&part, b"stale").unwrap();

        engine
            .load_manifest_str(r#"{"a.bin": "0123456789abcdef0123456789abcdef"}"#, false)
            .unwrap();
        assert!(!part.exists(), "part file should be cleared on identity change");
    }

    #[test]
    fn test_corrupt_state_file_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("fetch-state.json");
        std::fs::write(&state, "not json at all").unwrap();

        let engine = engine_in(dir.path());
        assert_eq!(engine.records().len(), 0);
    }

    #[test]
    fn test_newer_state_version_refused() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("fetch-state.json");
        std::fs::write(&state, r#"{"version": 99, "records": []}"#).unwrap();

        let config = EngineConfig::new(dir.path());
        assert!(Engine::new(config).is_err());
    }
}
