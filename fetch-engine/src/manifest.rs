//! Manifest loading.
//!
//! A manifest is a JSON object mapping filename to either a bare hex digest
//! string (interpreted as MD5) or an object with an explicit URL, digest and
//! optional size. Keys are filenames relative to the download root.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ManifestError;
use crate::state::record::{ExpectedDigest, HashAlgorithm};

/// One entry of the manifest after resolution against the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub url: String,
    pub digest: Option<ExpectedDigest>,
    pub size: Option<u64>,
}

/// A parsed manifest, ordered by entry name.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Digest(String),
    Full {
        url: Option<String>,
        digest: Option<ExpectedDigest>,
        size: Option<u64>,
    },
}

impl Manifest {
    /// Read and parse a manifest file.
    pub fn load(path: &Path, base_url: Option<&str>) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw, base_url)
    }

    /// Parse a manifest document. `base_url` supplies the URL for bare
    /// digest entries, which carry none of their own.
    pub fn parse(json: &str, base_url: Option<&str>) -> Result<Self, ManifestError> {
        let raw: BTreeMap<String, RawEntry> = serde_json::from_str(json)?;

        let mut entries = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let entry = match value {
                RawEntry::Digest(hex) => {
                    let digest = ExpectedDigest {
                        algorithm: HashAlgorithm::Md5,
                        value: normalize_hex(&name, &hex, HashAlgorithm::Md5)?,
                    };
                    ManifestEntry {
                        url: join_base(&name, None, base_url)?,
                        name,
                        digest: Some(digest),
                        size: None,
                    }
                }
                RawEntry::Full { url, digest, size } => {
                    let digest = digest
                        .map(|d| {
                            Ok::<_, ManifestError>(ExpectedDigest {
                                value: normalize_hex(&name, &d.value, d.algorithm)?,
                                algorithm: d.algorithm,
                            })
                        })
                        .transpose()?;
                    ManifestEntry {
                        url: join_base(&name, url.as_deref(), base_url)?,
                        name,
                        digest,
                        size,
                    }
                }
            };
            entries.push(entry);
        }

        Ok(Manifest { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve an entry's URL: explicit wins, otherwise the base URL joined
/// with the entry name.
fn join_base(
    name: &str,
    explicit: Option<&str>,
    base_url: Option<&str>,
) -> Result<String, ManifestError> {
    if let Some(url) = explicit {
        return Ok(url.to_string());
    }
    match base_url {
        Some(base) => Ok(format!("{}/{}", base.trim_end_matches('/'), name)),
        None => Err(ManifestError::Entry {
            name: name.to_string(),
            reason: "no url and no base url configured".to_string(),
        }),
    }
}

/// Lowercase the digest and reject values that are not plain hex of the
/// algorithm's length.
fn normalize_hex(
    name: &str,
    value: &str,
    algorithm: HashAlgorithm,
) -> Result<String, ManifestError> {
    let lower = value.to_ascii_lowercase();
    if lower.len() != algorithm.hex_len() || !lower.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ManifestError::Entry {
            name: name.to_string(),
            reason: format!("invalid {algorithm} digest {value:?}"),
        });
    }
    Ok(lower)
}
