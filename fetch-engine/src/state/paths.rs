//! State-file location resolution.
//!
//! The embedder hands the store a path; if its directory cannot be
//! written, the store falls back to the platform user-data directory.
//! Resolution happens once, at construction.

use std::path::{Path, PathBuf};
use tracing::warn;

/// Resolve the effective state-file path. Keeps the requested path when
/// its parent directory is writable, otherwise relocates the file name
/// into the platform user-data directory for `app_name`.
pub fn resolve_state_path(requested: &Path, app_name: &str) -> PathBuf {
    let parent = requested.parent().unwrap_or(Path::new("."));
    if dir_writable(parent) {
        return requested.to_path_buf();
    }

    let file_name = requested
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("state.json"));

    match user_data_dir(app_name) {
        Some(dir) if dir_writable(&dir) => {
            let fallback = dir.join(file_name);
            warn!(
                "state path {} not writable, falling back to {}",
                requested.display(),
                fallback.display()
            );
            fallback
        }
        _ => requested.to_path_buf(),
    }
}

/// Whether a directory exists (or can be created) and accepts writes.
fn dir_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".write-probe-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Platform user-data directory: roaming AppData on Windows, Application
/// Support on macOS, XDG data home elsewhere.
#[cfg(target_os = "windows")]
fn user_data_dir(app_name: &str) -> Option<PathBuf> {
    std::env::var_os("APPDATA").map(|base| PathBuf::from(base).join(app_name))
}

#[cfg(target_os = "macos")]
fn user_data_dir(app_name: &str) -> Option<PathBuf> {
    home::home_dir().map(|h| h.join("Library").join("Application Support").join(app_name))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn user_data_dir(app_name: &str) -> Option<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| home::home_dir().map(|h| h.join(".local").join("share")))?;
    Some(base.join(app_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writable_path_kept() {
        let dir = tempfile::tempdir().unwrap();
        let requested = dir.path().join("state.json");
        assert_eq!(resolve_state_path(&requested, "fetch-engine"), requested);
    }

    #[test]
    fn test_missing_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let requested = dir.path().join("nested").join("deeper").join("state.json");
        assert_eq!(resolve_state_path(&requested, "fetch-engine"), requested);
        assert!(requested.parent().unwrap().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_parent_falls_back() {
        // /proc is not writable for regular processes.
        let requested = Path::new("/proc/fetch-engine-test/state.json");
        let resolved = resolve_state_path(requested, "fetch-engine-test");
        assert_ne!(resolved, requested);
        assert!(resolved.ends_with("state.json"));
    }
}
