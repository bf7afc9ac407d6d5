//! Manifest-driven bulk download engine.
//!
//! Fetches large numbers of remote assets listed in a JSON manifest with
//! durable progress tracking, digest verification, resumable transfers and
//! an adaptive HTTP/2-preferred transport. The [`Engine`] value is the
//! embedder-facing surface; everything else composes underneath it.

pub mod compression;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod resume;
pub mod state;
pub mod task;
pub mod transport;
pub mod verify;

pub use config::EngineConfig;
pub use coordinator::RunSummary;
pub use engine::{Engine, EngineStats, StateCounts};
pub use error::{EngineError, ManifestError, Result, StateError, TransportError, VerifyError};
pub use manifest::{Manifest, ManifestEntry};
pub use progress::{LogCallback, LogEvent, LogLevel, ProgressCallback, ProgressUpdate};
pub use state::record::{ExpectedDigest, HashAlgorithm, ProgressRecord, Status, Verification};
pub use state::{MergeDiff, StateStore};
