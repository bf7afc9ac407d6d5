//! Persistent per-file progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::manifest::ManifestEntry;

/// Suffix appended to the target path while bytes are being accumulated.
pub const PART_SUFFIX: &str = ".part";

/// Lifecycle state of a single manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    VerifyFailed,
}

/// Verification state, tracked independently of transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    #[default]
    Unverified,
    Verifying,
    Verified,
    VerifyFailed,
}

/// Digest algorithm declared by the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Length of the hex encoding of a digest of this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

/// Expected digest from the manifest: declared algorithm plus hex value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

/// The persisted per-file record. `name` is the primary key and never
/// changes; everything else mutates under the state store's writer lock.
///
/// Unknown fields from newer writers are captured in `extra` and survive a
/// load/checkpoint round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<ExpectedDigest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,

    pub status: Status,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,

    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Relative to the configured download root.
    pub local_path: PathBuf,

    #[serde(default)]
    pub verification: Verification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_server: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProgressRecord {
    /// A fresh Pending record for a manifest entry with no prior state.
    pub fn new(entry: &ManifestEntry) -> Self {
        ProgressRecord {
            name: entry.name.clone(),
            url: entry.url.clone(),
            expected_digest: entry.digest.clone(),
            expected_size: entry.size,
            status: Status::Pending,
            bytes_downloaded: 0,
            total_bytes: None,
            attempts: 0,
            last_error: None,
            local_path: PathBuf::from(&entry.name),
            verification: Verification::Unverified,
            verified_digest: None,
            started_at: None,
            completed_at: None,
            etag: None,
            last_modified_server: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Absolute path of the completed file under the download root.
    pub fn final_path(&self, root: &Path) -> PathBuf {
        root.join(&self.local_path)
    }

    /// Absolute path of the in-flight sibling file.
    pub fn part_path(&self, root: &Path) -> PathBuf {
        part_path_for(&self.final_path(root))
    }

    /// The ordering hint used by the coordinator: the best size estimate
    /// currently available for this record.
    pub fn size_hint(&self) -> Option<u64> {
        self.expected_size.or(self.total_bytes)
    }
}

/// Append the `.part` suffix to a target path.
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            url: format!("http://example.test/{name}"),
            digest: Some(ExpectedDigest {
                algorithm: HashAlgorithm::Md5,
                value: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            }),
            size: Some(42),
        }
    }

    #[test]
    fn test_new_record_is_pending() {
        let rec = ProgressRecord::new(&entry("a/b.json"));
        assert_eq!(rec.status, Status::Pending);
        assert_eq!(rec.verification, Verification::Unverified);
        assert_eq!(rec.bytes_downloaded, 0);
        assert_eq!(rec.local_path, PathBuf::from("a/b.json"));
    }

    #[test]
    fn test_part_path() {
        let rec = ProgressRecord::new(&entry("dir/file.bin"));
        let root = Path::new("/downloads");
        assert_eq!(rec.final_path(root), PathBuf::from("/downloads/dir/file.bin"));
        assert_eq!(
            rec.part_path(root),
            PathBuf::from("/downloads/dir/file.bin.part")
        );
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let json = serde_json::json!({
            "name": "x.bin",
            "url": "http://example.test/x.bin",
            "status": "pending",
            "local_path": "x.bin",
            "future_field": {"nested": true}
        });
        let rec: ProgressRecord = serde_json::from_value(json).unwrap();
        assert!(rec.extra.contains_key("future_field"));

        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back["future_field"]["nested"], serde_json::json!(true));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Status::VerifyFailed).unwrap(),
            "\"verify_failed\""
        );
        assert_eq!(
            serde_json::to_string(&Status::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
