//! Integrity verification: streaming digests with a metadata-keyed cache.
//!
//! Hashing runs on the blocking pool behind a small worker semaphore sized
//! to the available hardware parallelism, so sustained CPU work never
//! starves the I/O executor no matter how many tasks are in flight. The
//! cache is keyed by (path, size, mtime, algorithm) and lives for the
//! process lifetime only.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::Semaphore;

use crate::error::VerifyError;
use crate::state::record::{ExpectedDigest, HashAlgorithm};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Worker count when hardware parallelism cannot be determined.
const DEFAULT_HASH_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    len: u64,
    mtime: Option<SystemTime>,
    algorithm: HashAlgorithm,
}

/// Digest computer with an in-memory result cache.
pub struct Verifier {
    cache: Mutex<HashMap<CacheKey, String>>,
    workers: Semaphore,
}

impl Verifier {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_HASH_WORKERS);
        Verifier {
            cache: Mutex::new(HashMap::new()),
            workers: Semaphore::new(workers),
        }
    }

    /// Compute the hex digest of a file, consulting the cache first.
    /// Entries are invalidated implicitly: a changed size or mtime produces
    /// a different key. At most one hash computation per hardware thread
    /// runs at a time; callers past that queue on the semaphore.
    pub async fn digest(
        &self,
        path: &Path,
        algorithm: HashAlgorithm,
    ) -> Result<String, VerifyError> {
        let meta = tokio::fs::metadata(path).await?;
        let key = CacheKey {
            path: path.to_path_buf(),
            len: meta.len(),
            mtime: meta.modified().ok(),
            algorithm,
        };

        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| VerifyError::Unavailable(std::io::Error::other(e)))?;
        let owned = path.to_path_buf();
        let computed = tokio::task::spawn_blocking(move || hash_file(&owned, algorithm))
            .await
            .map_err(|e| VerifyError::Unavailable(std::io::Error::other(e)))??;

        self.cache
            .lock()
            .unwrap()
            .insert(key, computed.clone());
        Ok(computed)
    }

    /// Digest the file and compare against the expected value.
    /// Returns the actual digest on match.
    pub async fn verify(
        &self,
        path: &Path,
        expected: &ExpectedDigest,
    ) -> Result<String, VerifyError> {
        let actual = self.digest(path, expected.algorithm).await?;
        if constant_time_eq(&expected.value, &actual) {
            Ok(actual)
        } else {
            Err(VerifyError::Mismatch {
                expected: expected.value.clone(),
                actual,
            })
        }
    }

    /// Concurrent hash computations currently admissible.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Verifier::new()
    }
}

/// Streaming hash with bounded memory.
fn hash_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    match algorithm {
        HashAlgorithm::Md5 => hash_reader::<Md5>(file),
        HashAlgorithm::Sha1 => hash_reader::<Sha1>(file),
        HashAlgorithm::Sha256 => hash_reader::<Sha256>(file),
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex digests without early exit. Inputs are normalized to
/// lowercase before comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents)
            .unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_known_vectors() {
        let (_dir, path) = write_temp(b"abc");
        let v = Verifier::new();

        assert_eq!(
            v.digest(&path, HashAlgorithm::Md5).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            v.digest(&path, HashAlgorithm::Sha1).await.unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            v.digest(&path, HashAlgorithm::Sha256).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_empty_file_md5() {
        let (_dir, path) = write_temp(b"");
        let v = Verifier::new();
        assert_eq!(
            v.digest(&path, HashAlgorithm::Md5).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn test_verify_mismatch() {
        let (_dir, path) = write_temp(b"abc");
        let v = Verifier::new();
        let expected = ExpectedDigest {
            algorithm: HashAlgorithm::Md5,
            value: "00000000000000000000000000000000".to_string(),
        };
        let err = v.verify(&path, &expected).await.unwrap_err();
        assert!(matches!(err, VerifyError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let v = Verifier::new();
        let err = v
            .digest(&dir.path().join("absent"), HashAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_change() {
        let (_dir, path) = write_temp(b"abc");
        let v = Verifier::new();
        let first = v.digest(&path, HashAlgorithm::Sha256).await.unwrap();

        // Rewrite contents; mtime/size change must miss the cache.
        std::fs::write(&path, b"abcd").unwrap();
        let second = v.digest(&path, HashAlgorithm::Sha256).await.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("ABcd12", "abCD12"));
        assert!(!constant_time_eq("abcd12", "abcd13"));
        assert!(!constant_time_eq("abcd", "abcd12"));
    }

    #[tokio::test]
    async fn test_concurrent_digests_share_bounded_workers() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = std::sync::Arc::new(Verifier::new());
        assert!(verifier.available_workers() >= 1);

        // Far more concurrent requests than workers; all must queue on the
        // semaphore and complete correctly.
        let mut handles = Vec::new();
        for i in 0..16 {
            let path = dir.path().join(format!("f{i}.bin"));
            std::fs::write(&path, vec![i as u8; 32 * 1024]).unwrap();
            let v = verifier.clone();
            handles.push(tokio::spawn(async move {
                v.digest(&path, HashAlgorithm::Sha256).await.unwrap()
            }));
        }
        for handle in handles {
            let digest = handle.await.unwrap();
            assert_eq!(digest.len(), 64);
        }
        assert_eq!(
            verifier.available_workers(),
            Verifier::new().available_workers(),
            "all permits must be returned"
        );
    }
}
