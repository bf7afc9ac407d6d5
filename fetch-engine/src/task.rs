//! Per-file transfer state machine.
//!
//! One task owns one manifest entry for the duration of a run: it probes,
//! plans, streams bytes into the `.part` sibling, verifies, and renames.
//! The rename is the sole durability barrier for the file's existence.
//! All record mutations go through the state store.

use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compression;
use crate::config::{RetryConfig, TransferConfig};
use crate::coordinator::RunCounters;
use crate::error::{describe_io, TransportError, VerifyError};
use crate::progress::{Callbacks, LogLevel, ProgressGate, ProgressUpdate, RateEstimator};
use crate::resume::{self, PlanInput, TransferPlan};
use crate::state::record::{Status, Verification};
use crate::state::StateStore;
use crate::transport::{FetchRequest, Probe, Transport};
use crate::verify::Verifier;

/// Everything a file task needs, cloned per spawn.
pub(crate) struct TaskContext<T: Transport> {
    pub store: Arc<StateStore>,
    pub transport: Arc<T>,
    pub verifier: Arc<Verifier>,
    pub root: PathBuf,
    pub retry: RetryConfig,
    pub transfer: TransferConfig,
    pub cancel: CancellationToken,
    pub callbacks: Callbacks,
    pub counters: Arc<RunCounters>,
}

impl<T: Transport> Clone for TaskContext<T> {
    fn clone(&self) -> Self {
        TaskContext {
            store: self.store.clone(),
            transport: self.transport.clone(),
            verifier: self.verifier.clone(),
            root: self.root.clone(),
            retry: self.retry.clone(),
            transfer: self.transfer.clone(),
            cancel: self.cancel.clone(),
            callbacks: self.callbacks.clone(),
            counters: self.counters.clone(),
        }
    }
}

/// Terminal result of one task, tallied by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Completed,
    Skipped,
    Failed,
    VerifyFailed,
    Cancelled,
}

enum AttemptOutcome {
    /// Bytes were transferred this session and the file finalized.
    Completed,
    /// A pre-existing local file verified without a transfer.
    Verified,
}

enum AttemptError {
    Transport(TransportError),
    Verify(VerifyError),
    Io(std::io::Error),
    Cancelled,
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        AttemptError::Transport(e)
    }
}

/// Drive one manifest entry to a terminal state.
pub(crate) async fn run_file_task<T: Transport>(ctx: TaskContext<T>, name: String) -> TaskOutcome {
    let Some(record) = ctx.store.get(&name) else {
        warn!("{name}: selected but has no record");
        return TaskOutcome::Failed;
    };

    // Completed fast path: a metadata match is enough, digests were
    // verified when the record completed.
    if record.status == Status::Completed {
        let len = file_len(&record.final_path(&ctx.root)).await;
        if len.is_some() && len == record.total_bytes {
            debug!("{name}: already completed");
            return TaskOutcome::Skipped;
        }
        // The completed file vanished or changed size; refetch it.
        ctx.store.update(&name, |r| {
            r.status = Status::Pending;
            r.verification = Verification::Unverified;
            r.verified_digest = None;
            r.bytes_downloaded = 0;
            r.completed_at = None;
        });
    }

    let mut corruption_refetch_used = false;
    let mut attempt = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            return rewind_cancelled(&ctx, &name);
        }

        attempt += 1;
        set_status(&ctx, &name, |r| {
            r.status = Status::InProgress;
            r.attempts += 1;
            r.last_error = None;
            if r.started_at.is_none() {
                r.started_at = Some(Utc::now());
            }
        });

        match attempt_once(&ctx, &name).await {
            Ok(AttemptOutcome::Completed) => return TaskOutcome::Completed,
            Ok(AttemptOutcome::Verified) => return TaskOutcome::Skipped,
            Err(AttemptError::Cancelled) => return rewind_cancelled(&ctx, &name),
            Err(AttemptError::Transport(e)) => {
                if e.is_transient() && attempt < ctx.retry.max_attempts {
                    let detail = e.to_string();
                    set_status(&ctx, &name, |r| {
                        r.status = Status::Pending;
                        r.last_error = Some(detail);
                    });
                    let delay = backoff_delay(&ctx.retry, attempt);
                    debug!("{name}: attempt {attempt} failed ({e}), retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return rewind_cancelled(&ctx, &name),
                    }
                    continue;
                }
                warn!("{name}: giving up after {attempt} attempt(s): {e}");
                let detail = e.to_string();
                set_status(&ctx, &name, |r| {
                    r.status = Status::Failed;
                    r.last_error = Some(detail);
                });
                ctx.callbacks
                    .emit_log(LogLevel::Error, Some(&name), format!("download failed: {e}"));
                return TaskOutcome::Failed;
            }
            Err(AttemptError::Verify(VerifyError::Mismatch { expected, actual })) => {
                // The local bytes are corrupt. Invalidate them and refetch
                // from scratch, at most once per run.
                invalidate_local(&ctx, &name).await;
                let detail = format!("digest mismatch: expected {expected}, got {actual}");
                if !corruption_refetch_used {
                    corruption_refetch_used = true;
                    warn!("{name}: {detail}; refetching");
                    set_status(&ctx, &name, |r| {
                        r.status = Status::Pending;
                        r.verification = Verification::VerifyFailed;
                        r.verified_digest = None;
                        r.bytes_downloaded = 0;
                        r.total_bytes = None;
                        r.last_error = Some(detail.clone());
                    });
                    continue;
                }
                warn!("{name}: {detail}; refetch already spent");
                set_status(&ctx, &name, |r| {
                    r.status = Status::VerifyFailed;
                    r.verification = Verification::VerifyFailed;
                    r.verified_digest = None;
                    r.bytes_downloaded = 0;
                    r.last_error = Some(detail.clone());
                });
                ctx.callbacks.emit_log(LogLevel::Error, Some(&name), detail);
                return TaskOutcome::VerifyFailed;
            }
            Err(AttemptError::Verify(VerifyError::Unavailable(e))) => {
                let detail = format!("cannot verify: {e}");
                set_status(&ctx, &name, |r| {
                    r.status = Status::Failed;
                    r.last_error = Some(detail.clone());
                });
                ctx.callbacks.emit_log(LogLevel::Error, Some(&name), detail);
                return TaskOutcome::Failed;
            }
            Err(AttemptError::Io(e)) => {
                // Local filesystem failure: not retried.
                let detail = describe_io(&e);
                warn!("{name}: i/o failure: {detail}");
                set_status(&ctx, &name, |r| {
                    r.status = Status::Failed;
                    r.last_error = Some(detail.clone());
                });
                ctx.callbacks
                    .emit_log(LogLevel::Error, Some(&name), format!("i/o failure: {detail}"));
                return TaskOutcome::Failed;
            }
        }
    }
}

async fn attempt_once<T: Transport>(
    ctx: &TaskContext<T>,
    name: &str,
) -> Result<AttemptOutcome, AttemptError> {
    let Some(record) = ctx.store.get(name) else {
        return Err(AttemptError::Io(std::io::Error::other("record vanished")));
    };

    let probe = ctx.transport.probe(&record.url).await?;
    if ctx.cancel.is_cancelled() {
        return Err(AttemptError::Cancelled);
    }

    let final_path = record.final_path(&ctx.root);
    let part_path = record.part_path(&ctx.root);
    let plan = resume::plan(&PlanInput {
        final_len: file_len(&final_path).await,
        part_len: file_len(&part_path).await,
        remote_size: probe.total_size,
        supports_range: probe.supports_range,
        prior_verify_failed: record.verification == Verification::VerifyFailed,
        resume_threshold: ctx.transfer.resume_threshold,
    });

    match plan {
        TransferPlan::VerifyFinal => {
            debug!("{name}: local file matches remote size, verifying only");
            finalize(ctx, name, &final_path, &final_path, Status::Skipped).await?;
            Ok(AttemptOutcome::Verified)
        }
        TransferPlan::VerifyPart => {
            debug!("{name}: partial file is complete, verifying only");
            finalize(ctx, name, &part_path, &final_path, Status::Skipped).await?;
            Ok(AttemptOutcome::Verified)
        }
        TransferPlan::Fresh => transfer(ctx, name, &probe, 0).await,
        TransferPlan::Resume { from } => {
            debug!("{name}: resuming from byte {from}");
            transfer(ctx, name, &probe, from).await
        }
    }
}

/// Stream the response body into the `.part` file, then verify and rename.
async fn transfer<T: Transport>(
    ctx: &TaskContext<T>,
    name: &str,
    probe: &Probe,
    resume_from: u64,
) -> Result<AttemptOutcome, AttemptError> {
    let Some(record) = ctx.store.get(name) else {
        return Err(AttemptError::Io(std::io::Error::other("record vanished")));
    };
    let final_path = record.final_path(&ctx.root);
    let part_path = record.part_path(&ctx.root);

    let request_plan =
        compression::request_plan(name, record.expected_size.or(probe.total_size));
    // Ranged continuations must be byte-exact; no encoding negotiation.
    let accept_encoding = if resume_from > 0 {
        None
    } else {
        request_plan.accept_encoding
    };

    let response = ctx
        .transport
        .fetch(FetchRequest {
            url: &record.url,
            range_start: (resume_from > 0).then_some(resume_from),
            accept_encoding,
        })
        .await?;

    // A 200 to a ranged request means the server ignored the range; the
    // partial bytes on disk are no longer meaningful.
    let mut start_offset = resume_from;
    if resume_from > 0 && !response.ranged {
        debug!("{name}: server ignored range request, restarting from zero");
        start_offset = 0;
    }

    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(AttemptError::Io)?;
    }

    let total = response.total_size;
    let etag = response.etag.clone();
    let last_modified = response.last_modified.clone();
    ctx.store.update(name, |r| {
        r.total_bytes = total;
        r.bytes_downloaded = start_offset;
        if etag.is_some() {
            r.etag = etag;
        }
        if last_modified.is_some() {
            r.last_modified_server = last_modified;
        }
    });

    let raw_counter = response.raw_bytes.clone();
    let written = if request_plan.buffered_decode && start_offset == 0 {
        write_buffered(ctx, name, &part_path, response.body).await?
    } else {
        write_streaming(ctx, name, &part_path, response.body, start_offset, total).await?
    };

    ctx.counters.add_raw(raw_counter.load(Ordering::Relaxed));
    ctx.counters.add_decoded(written.saturating_sub(start_offset));

    // Length check against the decoded total when one is known.
    if let Some(t) = total {
        if written != t {
            ctx.store.update(name, |r| r.bytes_downloaded = written);
            return Err(AttemptError::Transport(TransportError::Protocol(format!(
                "truncated response: {written} of {t} bytes"
            ))));
        }
    }

    ctx.store.update(name, |r| {
        r.bytes_downloaded = written;
        r.total_bytes = Some(written);
    });

    finalize(ctx, name, &part_path, &final_path, Status::Completed).await?;
    Ok(AttemptOutcome::Completed)
}

/// Streaming write path: append chunks through a fixed-size buffer,
/// debouncing record updates and progress emission.
async fn write_streaming<T: Transport>(
    ctx: &TaskContext<T>,
    name: &str,
    part_path: &Path,
    mut body: futures_util::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>,
    start_offset: u64,
    total: Option<u64>,
) -> Result<u64, AttemptError> {
    let file = open_part(part_path, start_offset).await?;
    let mut writer = BufWriter::with_capacity(ctx.transfer.chunk_size, file);
    let mut written = start_offset;
    let mut rate = RateEstimator::new();
    let mut gate = ProgressGate::new(Duration::from_millis(ctx.transfer.progress_interval_ms));

    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    writer.write_all(&bytes).await.map_err(AttemptError::Io)?;
                    written += bytes.len() as u64;
                    rate.on_bytes(bytes.len() as u64);
                    if gate.ready() {
                        ctx.store.update(name, |r| r.bytes_downloaded = written);
                        ctx.callbacks.emit_progress(ProgressUpdate {
                            name: name.to_string(),
                            status: Status::InProgress,
                            bytes_downloaded: written,
                            total_bytes: total,
                            rate_bps: rate.bps(),
                        });
                    }
                }
                Some(Err(e)) => {
                    // Keep what we have; a later attempt may resume from it.
                    settle_partial(ctx, name, writer, part_path).await;
                    return Err(AttemptError::Transport(TransportError::from_stream(&e)));
                }
                None => break,
            },
            _ = ctx.cancel.cancelled() => {
                // Finish the current chunk, flush, persist, exit.
                settle_partial(ctx, name, writer, part_path).await;
                return Err(AttemptError::Cancelled);
            }
        }
    }

    writer.flush().await.map_err(AttemptError::Io)?;
    let file = writer.into_inner();
    file.sync_all().await.map_err(AttemptError::Io)?;
    Ok(written)
}

/// Buffered decode path for small text documents: accumulate the decoded
/// body in memory and write it in one shot. Nothing is persisted on
/// failure or cancel.
async fn write_buffered<T: Transport>(
    ctx: &TaskContext<T>,
    name: &str,
    part_path: &Path,
    mut body: futures_util::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>,
) -> Result<u64, AttemptError> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(AttemptError::Transport(TransportError::from_stream(&e))),
                None => break,
            },
            _ = ctx.cancel.cancelled() => return Err(AttemptError::Cancelled),
        }
    }

    let mut file = tokio::fs::File::create(part_path)
        .await
        .map_err(AttemptError::Io)?;
    file.write_all(&buf).await.map_err(AttemptError::Io)?;
    file.sync_all().await.map_err(AttemptError::Io)?;

    let written = buf.len() as u64;
    ctx.store.update(name, |r| r.bytes_downloaded = written);
    Ok(written)
}

/// Open the `.part` file for a transfer. For resume the on-disk length is
/// re-verified via stat; any disagreement truncates and starts over.
async fn open_part(part_path: &Path, start_offset: u64) -> Result<tokio::fs::File, AttemptError> {
    if start_offset > 0 {
        let on_disk = file_len(part_path).await.unwrap_or(0);
        if on_disk == start_offset {
            return tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await
                .map_err(AttemptError::Io);
        }
    }
    tokio::fs::File::create(part_path)
        .await
        .map_err(AttemptError::Io)
}

/// Flush the writer and record exactly how many bytes the `.part` file
/// holds, so the record never claims fewer bytes than are on disk.
async fn settle_partial<T: Transport>(
    ctx: &TaskContext<T>,
    name: &str,
    mut writer: BufWriter<tokio::fs::File>,
    part_path: &Path,
) {
    let _ = writer.flush().await;
    let file = writer.into_inner();
    let _ = file.sync_all().await;
    drop(file);

    let on_disk = file_len(part_path).await.unwrap_or(0);
    ctx.store.update(name, |r| r.bytes_downloaded = on_disk);
}

/// Verify (when a digest is expected) and atomically move the source file
/// over the target path, then mark the record terminal.
async fn finalize<T: Transport>(
    ctx: &TaskContext<T>,
    name: &str,
    source: &Path,
    final_path: &Path,
    terminal: Status,
) -> Result<(), AttemptError> {
    let Some(record) = ctx.store.get(name) else {
        return Err(AttemptError::Io(std::io::Error::other("record vanished")));
    };

    let mut verified_digest = None;
    if let Some(expected) = &record.expected_digest {
        set_status(ctx, name, |r| r.verification = Verification::Verifying);
        let actual = ctx
            .verifier
            .verify(source, expected)
            .await
            .map_err(AttemptError::Verify)?;
        verified_digest = Some(actual);
    }

    let len = file_len(source).await.unwrap_or(0);
    if source != final_path {
        tokio::fs::rename(source, final_path)
            .await
            .map_err(AttemptError::Io)?;
    }

    set_status(ctx, name, |r| {
        r.status = terminal;
        r.completed_at = Some(Utc::now());
        r.bytes_downloaded = len;
        r.total_bytes = Some(len);
        r.last_error = None;
        if let Some(digest) = verified_digest {
            r.verification = Verification::Verified;
            r.verified_digest = Some(digest);
        }
    });
    Ok(())
}

/// Remove corrupt local bytes (both the partial and any finalized file).
async fn invalidate_local<T: Transport>(ctx: &TaskContext<T>, name: &str) {
    if let Some(record) = ctx.store.get(name) {
        let _ = tokio::fs::remove_file(record.part_path(&ctx.root)).await;
        let _ = tokio::fs::remove_file(record.final_path(&ctx.root)).await;
    }
}

/// Cancellation rewind: an in-flight record goes back to Pending with its
/// partial progress preserved.
fn rewind_cancelled<T: Transport>(ctx: &TaskContext<T>, name: &str) -> TaskOutcome {
    set_status(ctx, name, |r| {
        if r.status == Status::InProgress {
            r.status = Status::Pending;
        }
        if r.verification == Verification::Verifying {
            r.verification = Verification::Unverified;
        }
    });
    debug!("{name}: cancelled, rewound to pending");
    TaskOutcome::Cancelled
}

/// Mutate the record and emit one progress event for the transition.
fn set_status<T: Transport, M>(ctx: &TaskContext<T>, name: &str, mutate: M)
where
    M: FnOnce(&mut crate::state::record::ProgressRecord),
{
    ctx.store.update(name, mutate);
    if let Some(r) = ctx.store.get(name) {
        ctx.callbacks.emit_progress(ProgressUpdate {
            name: name.to_string(),
            status: r.status,
            bytes_downloaded: r.bytes_downloaded,
            total_bytes: r.total_bytes,
            rate_bps: 0,
        });
    }
}

/// Exponential backoff with ±25% jitter, capped.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry
        .base_delay_ms
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(20))
        .min(retry.max_delay_ms);
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((exp as f64 * factor) as u64)
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        };
        for _ in 0..32 {
            // Attempt 1: 1s nominal, jitter keeps it within ±25%.
            let d = backoff_delay(&retry, 1).as_millis() as u64;
            assert!((750..=1_250).contains(&d), "attempt 1 delay {d}");

            // Attempt 3: 4s nominal.
            let d = backoff_delay(&retry, 3).as_millis() as u64;
            assert!((3_000..=5_000).contains(&d), "attempt 3 delay {d}");

            // Attempt 12 would be 2048s; the cap bounds it at 30s ±25%.
            let d = backoff_delay(&retry, 12).as_millis() as u64;
            assert!((22_500..=37_500).contains(&d), "capped delay {d}");
        }
    }
}
