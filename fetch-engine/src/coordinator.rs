//! Download coordination: bounded admission, batching and drain.
//!
//! Tasks launch in batches, smallest expected size first, and the running
//! set never exceeds `max_concurrency`. Cancellation stops admission and
//! waits for in-flight tasks to rewind and exit; one task's failure never
//! aborts the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ConcurrencyConfig;
use crate::task::{run_file_task, TaskContext, TaskOutcome};
use crate::transport::Transport;

/// Byte counters shared by all tasks of a session.
#[derive(Debug, Default)]
pub struct RunCounters {
    raw_bytes: AtomicU64,
    decoded_bytes: AtomicU64,
}

impl RunCounters {
    pub fn add_raw(&self, n: u64) {
        self.raw_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_decoded(&self, n: u64) {
        self.decoded_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn raw(&self) -> u64 {
        self.raw_bytes.load(Ordering::Relaxed)
    }

    pub fn decoded(&self) -> u64 {
        self.decoded_bytes.load(Ordering::Relaxed)
    }
}

/// Result of one `start()` run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub verify_failed: usize,
    pub cancelled: usize,
    /// Wire bytes received this run.
    pub raw_bytes: u64,
    /// Decoded bytes written this run.
    pub decoded_bytes: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.failed + self.verify_failed + self.cancelled
    }
}

/// Order a selection for launch: ascending expected size so small files
/// complete early, name as the stable tiebreak, unknown sizes last.
fn launch_order<T: Transport>(ctx: &TaskContext<T>, selection: Vec<String>) -> VecDeque<String> {
    let mut keyed: Vec<(u64, String)> = selection
        .into_iter()
        .map(|name| {
            let size = ctx
                .store
                .get(&name)
                .and_then(|r| r.size_hint())
                .unwrap_or(u64::MAX);
            (size, name)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    keyed.into_iter().map(|(_, name)| name).collect()
}

/// Run a selection to completion (or cancellation).
pub(crate) async fn run<T: Transport>(
    ctx: TaskContext<T>,
    concurrency: &ConcurrencyConfig,
    selection: Vec<String>,
) -> RunSummary {
    let started = Instant::now();
    let total = selection.len();
    let mut queue = launch_order(&ctx, selection);
    let mut running: JoinSet<TaskOutcome> = JoinSet::new();
    let mut summary = RunSummary::default();

    info!(
        "starting run: {total} entries, max {} in flight, batches of {}",
        concurrency.max_concurrency, concurrency.batch_size
    );

    loop {
        // Admit in batch-sized rounds while capacity allows.
        while running.len() < concurrency.max_concurrency
            && !queue.is_empty()
            && !ctx.cancel.is_cancelled()
        {
            let room = concurrency.max_concurrency - running.len();
            for _ in 0..concurrency.batch_size.min(room) {
                let Some(name) = queue.pop_front() else { break };
                running.spawn(run_file_task(ctx.clone(), name));
            }
            // Suspension point between batch launches.
            tokio::task::yield_now().await;
        }

        match running.join_next().await {
            Some(Ok(outcome)) => match outcome {
                TaskOutcome::Completed => summary.completed += 1,
                TaskOutcome::Skipped => summary.skipped += 1,
                TaskOutcome::Failed => summary.failed += 1,
                TaskOutcome::VerifyFailed => summary.verify_failed += 1,
                TaskOutcome::Cancelled => summary.cancelled += 1,
            },
            Some(Err(e)) => {
                warn!("file task aborted: {e}");
                summary.failed += 1;
            }
            None => {
                if queue.is_empty() || ctx.cancel.is_cancelled() {
                    break;
                }
            }
        }
    }

    // Entries never launched because of cancellation stay Pending.
    summary.cancelled += queue.len();

    summary.raw_bytes = ctx.counters.raw();
    summary.decoded_bytes = ctx.counters.decoded();
    summary.elapsed = started.elapsed();

    debug!(
        "run finished: {} completed, {} skipped, {} failed, {} verify-failed, {} cancelled in {:?}",
        summary.completed,
        summary.skipped,
        summary.failed,
        summary.verify_failed,
        summary.cancelled,
        summary.elapsed
    );
    summary
}
