//! Progress surface: rate estimation, emission debouncing, and the
//! callback types the embedder subscribes with.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::state::record::Status;

/// Smoothing factor for the rate estimate.
const EWMA_ALPHA: f64 = 0.3;

/// Window over which instantaneous rate samples are taken.
const EWMA_WINDOW: Duration = Duration::from_millis(500);

/// One progress update for a single file.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub name: String,
    pub status: Status,
    /// Cumulative decoded bytes on disk for this file.
    pub bytes_downloaded: u64,
    /// Total decoded size when known.
    pub total_bytes: Option<u64>,
    /// Instantaneous transfer rate, bytes per second.
    pub rate_bps: u64,
}

/// Severity for log events relayed to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line surfaced through the log callback.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    /// File the event concerns, when it concerns one.
    pub name: Option<String>,
    pub message: String,
}

/// Callback for progress updates. Invoked on the executor; must not block.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Callback for log events. Invoked on the executor; must not block.
pub type LogCallback = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// The subscribed observer pair, cloned into every task.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub progress: Option<ProgressCallback>,
    pub log: Option<LogCallback>,
}

impl Callbacks {
    pub fn emit_progress(&self, update: ProgressUpdate) {
        if let Some(cb) = &self.progress {
            cb(update);
        }
    }

    pub fn emit_log(&self, level: LogLevel, name: Option<&str>, message: impl Into<String>) {
        if let Some(cb) = &self.log {
            cb(LogEvent {
                level,
                name: name.map(str::to_string),
                message: message.into(),
            });
        }
    }
}

/// Exponentially-weighted moving average of transfer rate, sampled over
/// fixed windows.
pub struct RateEstimator {
    window_start: Instant,
    window_bytes: u64,
    ewma_bps: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        RateEstimator {
            window_start: Instant::now(),
            window_bytes: 0,
            ewma_bps: 0.0,
        }
    }

    /// Record bytes received since the last call.
    pub fn on_bytes(&mut self, n: u64) {
        self.window_bytes += n;
        let elapsed = self.window_start.elapsed();
        if elapsed >= EWMA_WINDOW {
            let instant = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.ewma_bps = if self.ewma_bps == 0.0 {
                instant
            } else {
                EWMA_ALPHA * instant + (1.0 - EWMA_ALPHA) * self.ewma_bps
            };
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    pub fn bps(&self) -> u64 {
        self.ewma_bps as u64
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Debounce gate: `ready()` returns true at most once per interval.
pub struct ProgressGate {
    last: Instant,
    interval: Duration,
}

impl ProgressGate {
    pub fn new(interval: Duration) -> Self {
        ProgressGate {
            // Start open so the first chunk reports immediately.
            last: Instant::now() - interval,
            interval,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
