//! Durable progress state.
//!
//! The store owns the authoritative record set. File tasks request
//! mutations through [`StateStore::update`]; a single writer lock
//! serializes them. Checkpoints are coalesced and written atomically
//! (temp sibling, flush, rename).

pub mod paths;
pub mod record;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::StateError;
use crate::manifest::Manifest;
use crate::progress::{Callbacks, LogLevel};
use record::{ProgressRecord, Status, Verification};

/// Current state file schema version.
pub const STATE_VERSION: u32 = 1;

/// Minimum spacing between coalesced checkpoints.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive write failures after which the condition is surfaced.
const WRITE_FAILURE_SURFACE_AFTER: u32 = 3;

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    records: Vec<ProgressRecord>,
}

/// Outcome of reconciling a fresh manifest against prior state.
#[derive(Debug, Clone, Default)]
pub struct MergeDiff {
    /// Manifest entries with no prior record.
    pub added: Vec<String>,
    /// Records whose URL or expected digest changed; reset to Pending.
    pub updated: Vec<String>,
    /// Records matching the manifest in identity; kept untouched.
    pub preserved: Vec<String>,
    /// Records absent from the manifest (deleted only when pruning).
    pub removed: Vec<String>,
}

/// Durable mapping from file name to progress record.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, ProgressRecord>>,
    dirty: AtomicBool,
}

impl StateStore {
    /// Load (or initialize) the store. The requested path falls back to
    /// the platform user-data directory when not writable; any persisted
    /// `InProgress` records are healed to `Pending`.
    pub fn open(requested: &Path, download_root: &Path, app_name: &str) -> Result<Self, StateError> {
        let path = paths::resolve_state_path(requested, app_name);

        let mut records = BTreeMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: StateFile = serde_json::from_str(&raw)?;
            if file.version > STATE_VERSION {
                return Err(StateError::UnsupportedVersion {
                    found: file.version,
                    supported: STATE_VERSION,
                });
            }
            for mut rec in file.records {
                heal_record(&mut rec, download_root);
                records.insert(rec.name.clone(), rec);
            }
            debug!("loaded {} records from {}", records.len(), path.display());
        }

        Ok(StateStore {
            path,
            records: RwLock::new(records),
            dirty: AtomicBool::new(false),
        })
    }

    /// A store that ignores whatever is on disk and starts empty; the next
    /// checkpoint overwrites the old file. Used when the embedder chooses
    /// to proceed past a corrupt state file.
    pub fn discarding(requested: &Path, app_name: &str) -> Self {
        StateStore {
            path: paths::resolve_state_path(requested, app_name),
            records: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Effective on-disk location after fallback resolution.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconcile a manifest. Identity (URL + expected digest) decides
    /// preservation; a changed identity resets the record to Pending with
    /// verification invalidated. Records absent from the manifest are kept
    /// unless `prune`.
    pub fn merge(&self, manifest: &Manifest, prune: bool) -> MergeDiff {
        let mut diff = MergeDiff::default();
        let mut records = self.records.write().unwrap();

        for entry in &manifest.entries {
            match records.get_mut(&entry.name) {
                None => {
                    records.insert(entry.name.clone(), ProgressRecord::new(entry));
                    diff.added.push(entry.name.clone());
                }
                Some(rec) => {
                    let identity_changed =
                        rec.url != entry.url || rec.expected_digest != entry.digest;
                    if identity_changed {
                        rec.url = entry.url.clone();
                        rec.expected_digest = entry.digest.clone();
                        rec.expected_size = entry.size;
                        rec.status = Status::Pending;
                        rec.verification = Verification::Unverified;
                        rec.verified_digest = None;
                        rec.bytes_downloaded = 0;
                        rec.total_bytes = None;
                        rec.attempts = 0;
                        rec.last_error = None;
                        rec.completed_at = None;
                        rec.etag = None;
                        rec.last_modified_server = None;
                        diff.updated.push(entry.name.clone());
                    } else {
                        // New metadata may still arrive on reload.
                        rec.expected_size = entry.size.or(rec.expected_size);
                        diff.preserved.push(entry.name.clone());
                    }
                }
            }
        }

        let manifest_names: std::collections::BTreeSet<&str> =
            manifest.entries.iter().map(|e| e.name.as_str()).collect();
        diff.removed = records
            .keys()
            .filter(|k| !manifest_names.contains(k.as_str()))
            .cloned()
            .collect();
        if prune {
            for name in &diff.removed {
                records.remove(name);
            }
        }

        drop(records);
        self.dirty.store(true, Ordering::Release);
        diff
    }

    /// Apply a mutation under the writer lock and schedule a checkpoint.
    /// Returns false when the record does not exist.
    pub fn update<M>(&self, name: &str, mutate: M) -> bool
    where
        M: FnOnce(&mut ProgressRecord),
    {
        let mut records = self.records.write().unwrap();
        let Some(rec) = records.get_mut(name) else {
            return false;
        };
        mutate(rec);
        drop(records);
        self.dirty.store(true, Ordering::Release);
        true
    }

    pub fn get(&self, name: &str) -> Option<ProgressRecord> {
        self.records.read().unwrap().get(name).cloned()
    }

    /// Consistent copy of all records, ordered by name.
    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Write the full record set atomically: serialize to a temp sibling,
    /// flush to disk, rename over the target.
    pub async fn checkpoint(&self) -> Result<(), StateError> {
        // Clear before snapshotting: a mutation racing the write re-marks
        // and is picked up by the next tick.
        self.dirty.store(false, Ordering::Release);
        let mut records = self.snapshot();
        // The persisted form never claims an active transfer; a restart
        // resumes from Pending with whatever partial bytes survived.
        for rec in &mut records {
            if rec.status == Status::InProgress {
                rec.status = Status::Pending;
            }
            if rec.verification == Verification::Verifying {
                rec.verification = Verification::Unverified;
            }
        }
        let file = StateFile {
            version: STATE_VERSION,
            records,
        };

        let payload = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut out = tokio::fs::File::create(&tmp).await?;
        out.write_all(&payload).await?;
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Checkpoint only when a mutation happened since the last write.
    pub async fn checkpoint_if_dirty(&self) -> Result<bool, StateError> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.checkpoint().await?;
        Ok(true)
    }

    /// Coalesced checkpoint loop: at most one write per interval, plus a
    /// final checkpoint when cancelled. Failed writes retry on the next
    /// tick; three consecutive failures are surfaced through the log
    /// callback.
    pub async fn run_checkpoints(&self, cancel: CancellationToken, callbacks: Callbacks) {
        let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => break,
            }

            match self.checkpoint_if_dirty().await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    self.dirty.store(true, Ordering::Release);
                    warn!("state checkpoint failed ({consecutive_failures}): {e}");
                    if consecutive_failures == WRITE_FAILURE_SURFACE_AFTER {
                        error!("state checkpoints failing repeatedly: {e}");
                        callbacks.emit_log(
                            LogLevel::Error,
                            None,
                            format!("state file cannot be written: {e}"),
                        );
                    }
                }
            }
        }

        if let Err(e) = self.checkpoint().await {
            error!("final state checkpoint failed: {e}");
            callbacks.emit_log(
                LogLevel::Error,
                None,
                format!("final state checkpoint failed: {e}"),
            );
        }
    }
}

/// Recovery rule: a record can never rest `InProgress`. It demotes to
/// `Pending`, keeping its byte count only when a `.part` file of exactly
/// that size exists.
fn heal_record(rec: &mut ProgressRecord, root: &Path) {
    if rec.status == Status::InProgress {
        rec.status = Status::Pending;
        let part_len = std::fs::metadata(rec.part_path(root)).map(|m| m.len()).ok();
        if part_len != Some(rec.bytes_downloaded) {
            rec.bytes_downloaded = 0;
        }
    }
    if rec.verification == Verification::Verifying {
        rec.verification = Verification::Unverified;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::state::record::{ExpectedDigest, HashAlgorithm};

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
    const OTHER_MD5: &str = "0123456789abcdef0123456789abcdef";

    fn manifest_of(entries: &[(&str, &str)]) -> Manifest {
        Manifest {
            entries: entries
                .iter()
                .map(|(name, digest)| ManifestEntry {
                    name: name.to_string(),
                    url: format!("http://cdn.test/{name}"),
                    digest: Some(ExpectedDigest {
                        algorithm: HashAlgorithm::Md5,
                        value: digest.to_string(),
                    }),
                    size: None,
                })
                .collect(),
        }
    }

    fn empty_store(dir: &Path) -> StateStore {
        StateStore::open(&dir.join("state.json"), dir, "fetch-engine-test").unwrap()
    }

    #[test]
    fn test_merge_adds_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());

        let diff = store.merge(&manifest_of(&[("a.bin", EMPTY_MD5), ("b.bin", EMPTY_MD5)]), false);
        assert_eq!(diff.added, vec!["a.bin", "b.bin"]);
        assert!(diff.updated.is_empty());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a.bin").unwrap().status, Status::Pending);
    }

    #[test]
    fn test_merge_preserves_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());
        let manifest = manifest_of(&[("a.bin", EMPTY_MD5)]);

        store.merge(&manifest, false);
        store.update("a.bin", |r| {
            r.status = Status::Completed;
            r.verification = Verification::Verified;
            r.bytes_downloaded = 10;
            r.total_bytes = Some(10);
        });

        let diff = store.merge(&manifest, false);
        assert_eq!(diff.preserved, vec!["a.bin"]);
        let rec = store.get("a.bin").unwrap();
        assert_eq!(rec.status, Status::Completed);
        assert_eq!(rec.verification, Verification::Verified);
    }

    #[test]
    fn test_merge_resets_on_digest_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());

        store.merge(&manifest_of(&[("a.bin", EMPTY_MD5)]), false);
        store.update("a.bin", |r| {
            r.status = Status::Completed;
            r.verification = Verification::Verified;
            r.verified_digest = Some(EMPTY_MD5.to_string());
            r.bytes_downloaded = 10;
        });

        let diff = store.merge(&manifest_of(&[("a.bin", OTHER_MD5)]), false);
        assert_eq!(diff.updated, vec!["a.bin"]);
        let rec = store.get("a.bin").unwrap();
        assert_eq!(rec.status, Status::Pending);
        assert_eq!(rec.verification, Verification::Unverified);
        assert_eq!(rec.bytes_downloaded, 0);
        assert!(rec.verified_digest.is_none());
    }

    #[test]
    fn test_merge_retains_removed_unless_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());

        store.merge(&manifest_of(&[("a.bin", EMPTY_MD5), ("b.bin", EMPTY_MD5)]), false);

        let diff = store.merge(&manifest_of(&[("a.bin", EMPTY_MD5)]), false);
        assert_eq!(diff.removed, vec!["b.bin"]);
        assert!(store.get("b.bin").is_some());

        let diff = store.merge(&manifest_of(&[("a.bin", EMPTY_MD5)]), true);
        assert_eq!(diff.removed, vec!["b.bin"]);
        assert!(store.get("b.bin").is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());
        store.merge(&manifest_of(&[("a.bin", EMPTY_MD5)]), false);
        store.update("a.bin", |r| {
            r.status = Status::Completed;
            r.bytes_downloaded = 5;
            r.total_bytes = Some(5);
        });
        store.checkpoint().await.unwrap();

        let reopened = empty_store(dir.path());
        let rec = reopened.get("a.bin").unwrap();
        assert_eq!(rec.status, Status::Completed);
        assert_eq!(rec.bytes_downloaded, 5);
    }

    #[tokio::test]
    async fn test_checkpoint_never_persists_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());
        store.merge(&manifest_of(&[("a.bin", EMPTY_MD5)]), false);
        store.update("a.bin", |r| {
            r.status = Status::InProgress;
            r.bytes_downloaded = 4;
        });
        store.checkpoint().await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert!(!raw.contains("in_progress"), "persisted form: {raw}");

        // The in-memory view is untouched.
        assert_eq!(store.get("a.bin").unwrap().status, Status::InProgress);
    }

    #[test]
    fn test_load_heals_in_progress() {
        // A state file from a crashed or older writer may still carry
        // in-progress records; loading demotes them.
        let dir = tempfile::tempdir().unwrap();
        let record = |name: &str, bytes: u64| {
            serde_json::json!({
                "name": name,
                "url": format!("http://cdn.test/{name}"),
                "status": "in_progress",
                "bytes_downloaded": bytes,
                "local_path": name,
            })
        };
        let file = serde_json::json!({
            "version": 1,
            "records": [record("a.bin", 4), record("b.bin", 9)],
        });
        std::fs::write(
            dir.path().join("state.json"),
            serde_json::to_vec(&file).unwrap(),
        )
        .unwrap();

        // a.bin has a matching .part file; b.bin has none.
        std::fs::write(dir.path().join("a.bin.part"), b"1234").unwrap();

        let store = empty_store(dir.path());
        let a = store.get("a.bin").unwrap();
        assert_eq!(a.status, Status::Pending);
        assert_eq!(a.bytes_downloaded, 4);

        let b = store.get("b.bin").unwrap();
        assert_eq!(b.status, Status::Pending);
        assert_eq!(b.bytes_downloaded, 0);
    }

    #[test]
    fn test_newer_version_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "records": []}"#).unwrap();

        let err = StateStore::open(&path, dir.path(), "fetch-engine-test").unwrap_err();
        assert!(matches!(err, StateError::UnsupportedVersion { found: 99, .. }));
    }

    #[test]
    fn test_corrupt_state_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = StateStore::open(&path, dir.path(), "fetch-engine-test").unwrap_err();
        assert!(matches!(err, StateError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_is_atomic_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());
        store.merge(&manifest_of(&[("a.bin", EMPTY_MD5)]), false);
        store.checkpoint().await.unwrap();

        // The temp sibling must not linger after a successful write.
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(dir.path().join("state.json").exists());
    }
}
