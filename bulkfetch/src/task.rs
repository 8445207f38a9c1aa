//! Per-file download task.
//!
//! One task owns one record for the duration of a run: it probes the
//! remote, asks the resume planner what to do, drives the transport,
//! streams decoded bytes into the sibling `.part` file, verifies the
//! digest and publishes the result with an atomic rename. Transient
//! transport failures are retried with exponential backoff and jitter;
//! everything else is policy-free and reported upward.
//!
//! The task is also where cancellation is observed: the token is checked
//! between chunks, before each retry delay and before each network call,
//! and a cancelled task always leaves its record rewound to `Pending` with
//! the partial byte count persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{EventSink, ProgressUpdate};
use crate::policy;
use crate::record::{DownloadStatus, ProgressRecord, VerifyState};
use crate::resume::{self, LocalState, TransferPlan};
use crate::state::StateStore;
use crate::stats::TransferMetrics;
use crate::transport::{
    origin_of, BodyDecoder, FetchRequest, ProbeInfo, Transport, TransportError,
};
use crate::verify::{Verifier, VerifyError};

/// Minimum interval between progress callbacks for one file.
const PROGRESS_DEBOUNCE: Duration = Duration::from_millis(100);

/// Rate sampling window for the EWMA estimator.
const RATE_WINDOW: Duration = Duration::from_millis(500);

/// EWMA smoothing factor.
const RATE_ALPHA: f64 = 0.3;

/// Everything a task needs, cloned per spawned file.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub store: StateStore,
    pub transport: Arc<dyn Transport>,
    pub verifier: Arc<Verifier>,
    pub metrics: Arc<TransferMetrics>,
    pub config: Arc<EngineConfig>,
    pub events: EventSink,
    pub cancel: CancellationToken,
    pub root: PathBuf,
}

/// Terminal result of one task, for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Completed,
    /// Verified without transferring any bytes this session.
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

enum AttemptOk {
    /// Bytes moved; file verified and renamed into place.
    Transferred { total: u64, digest: String },
    /// Planner said `VerifyOnly` and the existing file checked out.
    AlreadyComplete { total: u64, digest: String },
}

/// Run one record to a terminal state.
pub(crate) async fn run(ctx: &TaskContext, name: &str) -> TaskOutcome {
    if ctx.store.get(name).await.is_none() {
        warn!(name, "task dispatched for unknown record");
        return TaskOutcome::Failed;
    }

    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if ctx.cancel.is_cancelled() {
            return rewind(ctx, name).await;
        }

        ctx.store.update(name, |r| r.mark_in_progress()).await;
        emit_transition(ctx, name).await;

        match attempt_once(ctx, name).await {
            Ok(AttemptOk::Transferred { total, digest }) => {
                ctx.store
                    .update(name, |r| r.mark_completed(total, Some(digest.clone())))
                    .await;
                emit_transition(ctx, name).await;
                info!(name, bytes = total, attempt, "download complete");
                return TaskOutcome::Completed;
            }
            Ok(AttemptOk::AlreadyComplete { total, digest }) => {
                ctx.store
                    .update(name, |r| r.mark_skipped(total, Some(digest.clone())))
                    .await;
                emit_transition(ctx, name).await;
                debug!(name, bytes = total, "already on disk, verified");
                return TaskOutcome::Skipped;
            }
            Err(TaskError::Cancelled) => {
                return rewind(ctx, name).await;
            }
            Err(TaskError::Verify(VerifyError::Mismatch { expected, actual })) => {
                let message = format!("digest mismatch: expected {expected}, got {actual}");
                discard_local(ctx, name).await;
                // One corruption-protection refetch per manifest load; the
                // marker lives on the record so repeated `start()` calls
                // against the same manifest cannot loop, and only a merge
                // renews it. A second mismatch means the remote itself is
                // bad.
                let refetch_spent = ctx
                    .store
                    .get(name)
                    .await
                    .map(|r| r.verify_refetch_used)
                    .unwrap_or(true);
                if !refetch_spent {
                    warn!(name, %message, "verification failed, refetching once");
                    ctx.store
                        .update(name, |r| {
                            r.mark_verify_failed(&message);
                            r.verify_refetch_used = true;
                            r.status = DownloadStatus::Pending;
                        })
                        .await;
                    emit_transition(ctx, name).await;
                    continue;
                }
                ctx.store.update(name, |r| r.mark_verify_failed(&message)).await;
                emit_transition(ctx, name).await;
                ctx.events.log(&format!("{name}: {message}"));
                return TaskOutcome::Failed;
            }
            Err(TaskError::Transport(error))
                if error.is_transient() && attempt < ctx.config.max_attempts =>
            {
                let delay = backoff_delay(&ctx.config, attempt);
                warn!(
                    name,
                    %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient transport failure, backing off"
                );
                ctx.store
                    .update(name, |r| r.last_error = Some(error.to_string()))
                    .await;

                tokio::select! {
                    _ = ctx.cancel.cancelled() => return rewind(ctx, name).await,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                let message = error.to_string();
                ctx.store.update(name, |r| r.mark_failed(&message)).await;
                emit_transition(ctx, name).await;
                ctx.events.log(&format!("{name}: {message}"));
                warn!(name, %message, attempt, "download failed");
                return TaskOutcome::Failed;
            }
        }
    }
}

/// One probe-plan-transfer cycle.
async fn attempt_once(ctx: &TaskContext, name: &str) -> Result<AttemptOk, TaskError> {
    let Some(record) = ctx.store.get(name).await else {
        return Err(TaskError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "record disappeared mid-task",
        )));
    };

    let final_path = ctx.root.join(&record.local_path);
    let part_path = ctx.root.join(record.part_path());

    if ctx.cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    let probe = ctx.transport.probe(&record.url).await?;
    ctx.store
        .update(name, |r| {
            r.total_bytes = probe.total_size;
            r.last_modified_server = probe.validator().map(str::to_string);
        })
        .await;

    let local = LocalState {
        final_size: file_size(&final_path).await,
        part_size: file_size(&part_path).await,
        verify_failed: record.verification == VerifyState::VerifyFailed,
    };
    let plan = resume::plan(local, &probe, ctx.config.resume_threshold);
    debug!(name, ?plan, total = ?probe.total_size, ranges = probe.supports_range, "transfer planned");

    match plan {
        TransferPlan::VerifyOnly => {
            ctx.store
                .update(name, |r| r.verification = VerifyState::Verifying)
                .await;
            let digest = ctx
                .verifier
                .verify(&final_path, &record.expected_digest)
                .await?;
            Ok(AttemptOk::AlreadyComplete {
                total: local.final_size.unwrap_or(0),
                digest,
            })
        }
        TransferPlan::Fresh => {
            transfer(ctx, &record, &probe, 0, &final_path, &part_path).await
        }
        TransferPlan::Resume { offset } => {
            transfer(ctx, &record, &probe, offset, &final_path, &part_path).await
        }
    }
}

/// Stream the body into the `.part` file, verify, and rename into place.
async fn transfer(
    ctx: &TaskContext,
    record: &ProgressRecord,
    probe: &ProbeInfo,
    offset: u64,
    final_path: &Path,
    part_path: &Path,
) -> Result<AttemptOk, TaskError> {
    let request_plan = policy::request_plan(
        &record.name,
        record.expected_size.or(probe.total_size),
    );
    // A ranged request must not negotiate encoding: the range would apply
    // to the encoded body and the offsets would no longer line up.
    let accept_encoding = if offset > 0 {
        None
    } else {
        request_plan.accept_encoding
    };

    if offset == 0 {
        remove_if_present(part_path).await?;
    }

    let mut response = ctx
        .transport
        .open(FetchRequest {
            url: record.url.clone(),
            range_start: (offset > 0).then_some(offset),
            accept_encoding,
        })
        .await?;
    ctx.metrics
        .record_request(response.protocol, &origin_of(&record.url));

    let mut start_at = offset;
    if offset > 0 && !response.is_partial {
        // Server ignored the range and is sending the whole body; the
        // local partial is now meaningless.
        warn!(name = %record.name, "server ignored range request, restarting from zero");
        remove_if_present(part_path).await?;
        start_at = 0;
    }

    let file = if start_at > 0 {
        let on_disk = file_size(part_path).await.unwrap_or(0);
        if on_disk != start_at {
            // The .part file changed between planning and open; retry the
            // whole attempt rather than corrupt the offset math.
            return Err(TransportError::Protocol(format!(
                "partial file moved under us: planned offset {start_at}, on disk {on_disk}"
            ))
            .into());
        }
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(part_path)
            .await?
    } else {
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(part_path).await?
    };
    let mut writer = BufWriter::new(file);

    let mut decoder = BodyDecoder::new(response.content_encoding);
    // Small compressible payloads (policy: JSON) decode into memory and
    // hit the disk once; everything else streams through.
    let buffer_decode = request_plan.buffered_decode
        && !response.content_encoding.is_identity()
        && start_at == 0;
    let mut staged: Vec<u8> = Vec::new();
    let mut bytes_written = start_at;
    let mut reporter = ProgressReporter::new(record.name.clone(), start_at);

    loop {
        if ctx.cancel.is_cancelled() {
            // Finish the current chunk's write, persist exact progress,
            // and leave the .part file for a later resume. Staged bytes
            // never reached the disk, so they do not count.
            writer.flush().await?;
            let on_disk = if buffer_decode { 0 } else { bytes_written };
            persist_partial(ctx, &record.name, on_disk).await;
            return Err(TaskError::Cancelled);
        }

        let chunk = match response.body.next().await {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(error)) => {
                // Same discipline as the cancellation branch: everything
                // read so far reaches the disk before the attempt ends, so
                // the next attempt's resume offset sees all of it.
                writer.flush().await?;
                return Err(error.into());
            }
        };
        ctx.metrics.add_raw_bytes(chunk.len() as u64);

        let decoded = decoder.write(&chunk)?;
        if !decoded.is_empty() {
            if buffer_decode {
                staged.extend_from_slice(&decoded);
            } else {
                writer.write_all(&decoded).await?;
            }
            bytes_written += decoded.len() as u64;
            ctx.metrics.add_decoded_bytes(decoded.len() as u64);
        }

        if reporter.due() {
            if !buffer_decode {
                persist_partial(ctx, &record.name, bytes_written).await;
            }
            reporter.emit(ctx, bytes_written, probe.total_size).await;
        }
    }

    let tail = decoder.finish()?;
    if !tail.is_empty() {
        if buffer_decode {
            staged.extend_from_slice(&tail);
        } else {
            writer.write_all(&tail).await?;
        }
        bytes_written += tail.len() as u64;
        ctx.metrics.add_decoded_bytes(tail.len() as u64);
    }
    if buffer_decode {
        writer.write_all(&staged).await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    // The probe's size is authoritative; a short or long body is a
    // transport fault, not a verification fault.
    if let Some(expected) = probe.total_size {
        if bytes_written != expected {
            return Err(TransportError::Protocol(format!(
                "body length mismatch: wrote {bytes_written} of {expected} bytes"
            ))
            .into());
        }
    }

    ctx.store
        .update(&record.name, |r| {
            r.bytes_downloaded = bytes_written;
            r.verification = VerifyState::Verifying;
        })
        .await;

    let digest = ctx
        .verifier
        .verify(part_path, &record.expected_digest)
        .await?;

    tokio::fs::rename(part_path, final_path).await?;
    ctx.verifier.invalidate(part_path);

    Ok(AttemptOk::Transferred {
        total: bytes_written,
        digest,
    })
}

/// Cancel cleanup: status back to `Pending`, partial bytes kept.
async fn rewind(ctx: &TaskContext, name: &str) -> TaskOutcome {
    ctx.store
        .update(name, |r| {
            if r.status == DownloadStatus::InProgress {
                r.reset(true);
            }
        })
        .await;
    emit_transition(ctx, name).await;
    debug!(name, "task cancelled, rewound to pending");
    TaskOutcome::Cancelled
}

/// Remove both local artifacts after a digest mismatch.
async fn discard_local(ctx: &TaskContext, name: &str) {
    if let Some(record) = ctx.store.get(name).await {
        let final_path = ctx.root.join(&record.local_path);
        let part_path = ctx.root.join(record.part_path());
        let _ = tokio::fs::remove_file(&final_path).await;
        let _ = tokio::fs::remove_file(&part_path).await;
        ctx.verifier.invalidate(&final_path);
        ctx.verifier.invalidate(&part_path);
    }
}

async fn persist_partial(ctx: &TaskContext, name: &str, bytes: u64) {
    ctx.store
        .update(name, |r| r.bytes_downloaded = bytes)
        .await;
}

/// Emit one progress update reflecting the record's current state. Used on
/// every state transition, outside the debounce window.
async fn emit_transition(ctx: &TaskContext, name: &str) {
    if let Some(record) = ctx.store.get(name).await {
        ctx.events.progress(&ProgressUpdate {
            name: record.name,
            status: record.status,
            bytes_downloaded: record.bytes_downloaded,
            total_bytes: record.total_bytes,
            rate_bps: 0.0,
        });
    }
}

fn backoff_delay(config: &EngineConfig, attempt: u32) -> Duration {
    let exp = config.retry_base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = exp.min(config.retry_cap.as_secs_f64());
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_secs_f64(capped * jitter)
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Debounced progress emission with an EWMA transfer rate.
struct ProgressReporter {
    name: String,
    last_emit: Instant,
    window_start: Instant,
    window_bytes_base: u64,
    ewma_bps: f64,
}

impl ProgressReporter {
    fn new(name: String, start_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            name,
            // Backdate so the first chunk reports immediately.
            last_emit: now - PROGRESS_DEBOUNCE,
            window_start: now,
            window_bytes_base: start_bytes,
            ewma_bps: 0.0,
        }
    }

    fn due(&self) -> bool {
        self.last_emit.elapsed() >= PROGRESS_DEBOUNCE
    }

    fn rate(&mut self, bytes_now: u64) -> f64 {
        let elapsed = self.window_start.elapsed();
        if elapsed >= RATE_WINDOW {
            let window_bytes = bytes_now.saturating_sub(self.window_bytes_base);
            let instantaneous = window_bytes as f64 / elapsed.as_secs_f64();
            self.ewma_bps = if self.ewma_bps == 0.0 {
                instantaneous
            } else {
                RATE_ALPHA * instantaneous + (1.0 - RATE_ALPHA) * self.ewma_bps
            };
            self.window_start = Instant::now();
            self.window_bytes_base = bytes_now;
        }
        self.ewma_bps
    }

    async fn emit(&mut self, ctx: &TaskContext, bytes: u64, total: Option<u64>) {
        let rate_bps = self.rate(bytes);
        self.last_emit = Instant::now();
        ctx.events.progress(&ProgressUpdate {
            name: self.name.clone(),
            status: DownloadStatus::InProgress,
            bytes_downloaded: bytes,
            total_bytes: total,
            rate_bps,
        });
    }
}
