//! Download coordinator.
//!
//! [`Engine`] is the embedder-facing entry point: it owns the state store,
//! the verifier and the aggregate metrics, builds a transport sized for
//! each run, and drives the selected records through file tasks under a
//! global concurrency bound.
//!
//! # Scheduling
//!
//! Work is admitted in batches (smallest file first, stable name
//! tiebreak); a semaphore enforces `max_concurrency` across batches, so
//! the next batch starts filling as soon as running tasks finish.
//! Cancellation is cooperative: `cancel()` flips a token that every task
//! observes between chunks, and `start()` returns only after the in-flight
//! tasks have drained and rewound their records to `Pending`.
//!
//! # Example
//!
//! ```ignore
//! use bulkfetch::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.load_manifest(Path::new("manifest.json")).await?;
//! engine.set_download_root(Path::new("./assets")).await?;
//! let summary = engine.start().await?;
//! println!("done: {} completed, {} failed", summary.completed, summary.failed);
//! engine.close().await?;
//! ```

mod schedule;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{EventSink, LogCallback, ProgressCallback};
use crate::manifest::{Manifest, ManifestError};
use crate::record::{ProgressRecord, VerifyState};
use crate::state::{MergeDiff, StateError, StateStore};
use crate::stats::{StatsSnapshot, TransferMetrics};
use crate::task::{self, TaskContext, TaskOutcome};
use crate::transport::{FallbackTransport, Transport, TransportError, TransportProfile};
use crate::verify::Verifier;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("download root I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a run is already in progress")]
    AlreadyRunning,
}

/// Terminal tallies of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    /// Verified without moving bytes this session.
    pub skipped: usize,
    pub failed: usize,
    /// Rewound to `Pending` by cancellation.
    pub cancelled: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.failed + self.cancelled
    }
}

/// The download engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: StateStore,
    verifier: Arc<Verifier>,
    metrics: Arc<TransferMetrics>,
    events: EventSink,
    transport_override: Mutex<Option<Arc<dyn Transport>>>,
    root: Mutex<PathBuf>,
    selection: Mutex<Vec<String>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl Engine {
    /// Construct an engine bound to its state file.
    ///
    /// A corrupt state file is reported and replaced with an empty record
    /// set; an unsupported (newer) version or an unreadable path is an
    /// error the embedder has to resolve.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let config = config.sanitized();
        let store = match StateStore::open(&config.state_path) {
            Ok(store) => store,
            Err(StateError::Corrupt(e)) => {
                warn!(%e, "state file is corrupt, starting with an empty record set");
                StateStore::empty(&config.state_path)
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            verifier: Arc::new(Verifier::new(config.hash_parallelism)),
            store,
            metrics: Arc::new(TransferMetrics::new()),
            events: EventSink::default(),
            transport_override: Mutex::new(None),
            root: Mutex::new(PathBuf::from(".")),
            selection: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            config: Arc::new(config),
        })
    }

    /// Replace the per-run transport with a fixed implementation. Used by
    /// tests and by embedders with special transport needs.
    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        *self.transport_override.lock() = Some(transport);
        self
    }

    /// Load a manifest and reconcile it with prior state.
    ///
    /// Entries whose URL or digest changed are reset to `Pending` and
    /// their stale `.part` files removed.
    pub async fn load_manifest(&self, path: &Path) -> Result<MergeDiff, EngineError> {
        let manifest = Manifest::load(path, self.config.base_url.as_deref()).await?;
        let diff = self.store.merge(&manifest, self.config.prune_on_merge).await;

        let root = self.root.lock().clone();
        for name in &diff.updated {
            let part = root.join(format!("{name}.part"));
            if tokio::fs::remove_file(&part).await.is_ok() {
                debug!(name = %name, "cleared stale .part after manifest update");
            }
        }

        info!(
            added = diff.added.len(),
            updated = diff.updated.len(),
            preserved = diff.preserved.len(),
            removed = diff.removed.len(),
            "manifest loaded"
        );
        Ok(diff)
    }

    /// Set the directory downloads land in, creating it if needed.
    /// Persisted partial byte counts are reconciled against the `.part`
    /// files actually present under the new root.
    pub async fn set_download_root(&self, path: &Path) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(path).await?;
        *self.root.lock() = path.to_path_buf();
        self.store.reconcile_partials(path).await;
        Ok(())
    }

    /// Restrict the next run to the named records. An empty selection
    /// means "everything not already done".
    pub fn select(&self, names: Vec<String>) {
        *self.selection.lock() = names;
    }

    /// Register progress/log callbacks. Callbacks run on the engine's
    /// executor and must not block.
    pub fn subscribe(&self, progress: Option<ProgressCallback>, log: Option<LogCallback>) {
        self.events.subscribe(progress, log);
    }

    /// Request cooperative cancellation of the current run. Returns
    /// immediately; `start()` itself waits for the graceful drain.
    ///
    /// There is no separate pause operation: cancel persists partial
    /// progress, and a later `start()` resumes from it.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Read-only statistics snapshot.
    pub async fn statistics(&self) -> StatsSnapshot {
        self.metrics.snapshot(self.store.counts_by_state().await)
    }

    /// Copy of all records, for display.
    pub async fn records(&self) -> Vec<ProgressRecord> {
        self.store.snapshot().await
    }

    /// Resolved state file location.
    pub fn state_path(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }

    /// Drop all persisted state. Only valid between runs.
    pub async fn clear_state(&self) -> Result<(), EngineError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        self.store.clear().await?;
        Ok(())
    }

    /// Run the current selection to completion.
    pub async fn start(&self) -> Result<RunSummary, EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let result = self.run_selection().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Final checkpoint and shutdown. The engine stays usable only for
    /// read access afterwards.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.cancel();
        self.store.checkpoint().await?;
        if let Some(transport) = self.transport_override.lock().clone() {
            transport.close_all();
        }
        Ok(())
    }

    async fn run_selection(&self) -> Result<RunSummary, EngineError> {
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.metrics.run_started();

        let root = self.root.lock().clone();
        let selected = {
            let explicit = self.selection.lock().clone();
            if explicit.is_empty() {
                self.store.pending_names().await
            } else {
                explicit
            }
        };

        let total_records = self.store.snapshot().await.len();
        let mut summary = RunSummary::default();
        let mut to_run: Vec<ProgressRecord> = Vec::new();

        // One directory scan replaces a stat per already-completed entry.
        let on_disk = scan_root(&root).await;
        for name in &selected {
            let Some(record) = self.store.get(name).await else {
                warn!(name = %name, "selection references unknown record");
                continue;
            };
            if completed_on_disk(&record, &on_disk, &root).await {
                summary.skipped += 1;
                continue;
            }
            to_run.push(record);
        }

        schedule::order_small_first(&mut to_run);
        let batch_size =
            schedule::effective_batch_size(self.config.batch_size, total_records, to_run.len());

        info!(
            selected = selected.len(),
            to_run = to_run.len(),
            already_complete = summary.skipped,
            batch_size,
            max_concurrency = self.config.max_concurrency,
            "run starting"
        );
        self.events.log(&format!(
            "starting {} downloads ({} already complete)",
            to_run.len(),
            summary.skipped
        ));

        let transport = match self.transport_override.lock().clone() {
            Some(transport) => transport,
            None => {
                let profile =
                    TransportProfile::for_workload(to_run.len(), average_known_size(&to_run));
                Arc::new(FallbackTransport::new(profile)?) as Arc<dyn Transport>
            }
        };

        let checkpoint_stop = CancellationToken::new();
        let checkpointer = self
            .store
            .spawn_checkpointer(checkpoint_stop.clone(), self.events.clone());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut handles = Vec::with_capacity(to_run.len());

        'admission: for batch in to_run.chunks(batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            for record in batch {
                // The permit is the concurrency bound; acquiring it is a
                // suspension point, so cancellation is re-checked after.
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break 'admission;
                };
                if cancel.is_cancelled() {
                    break 'admission;
                }

                let ctx = TaskContext {
                    store: self.store.clone(),
                    transport: Arc::clone(&transport),
                    verifier: Arc::clone(&self.verifier),
                    metrics: Arc::clone(&self.metrics),
                    config: Arc::clone(&self.config),
                    events: self.events.clone(),
                    cancel: cancel.clone(),
                    root: root.clone(),
                };
                let name = record.name.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    task::run(&ctx, &name).await
                }));
            }
        }

        for handle in handles {
            match handle.await {
                Ok(TaskOutcome::Completed) => summary.completed += 1,
                Ok(TaskOutcome::Skipped) => summary.skipped += 1,
                Ok(TaskOutcome::Failed) => summary.failed += 1,
                Ok(TaskOutcome::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    warn!(%e, "task panicked");
                    summary.failed += 1;
                }
            }
        }

        checkpoint_stop.cancel();
        let _ = checkpointer.await;
        self.store.checkpoint().await?;

        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run finished"
        );
        self.events.log(&format!(
            "run finished: {} completed, {} skipped, {} failed, {} cancelled",
            summary.completed, summary.skipped, summary.failed, summary.cancelled
        ));
        Ok(summary)
    }
}

/// Completed-record fast path: trust the record when a verified file of
/// the recorded size is still on disk, without hashing it again.
async fn completed_on_disk(
    record: &ProgressRecord,
    on_disk: &HashMap<String, u64>,
    root: &Path,
) -> bool {
    if !record.status.is_done() || record.verification != VerifyState::Verified {
        return false;
    }
    let Some(total) = record.total_bytes else {
        return false;
    };
    match on_disk.get(&record.local_path) {
        Some(size) => *size == total,
        // Nested paths are not in the flat scan; fall back to one stat.
        None => tokio::fs::metadata(root.join(&record.local_path))
            .await
            .map(|m| m.len() == total)
            .unwrap_or(false),
    }
}

/// Single flat scan of the download root, name → size.
async fn scan_root(root: &Path) -> HashMap<String, u64> {
    let mut sizes = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return sizes;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    sizes.insert(name, meta.len());
                }
            }
        }
    }
    sizes
}

fn average_known_size(records: &[ProgressRecord]) -> u64 {
    let known: Vec<u64> = records
        .iter()
        .filter_map(|r| r.expected_size.or(r.total_bytes))
        .collect();
    if known.is_empty() {
        // No sizes to go on; assume mid-sized files.
        1024 * 1024
    } else {
        known.iter().sum::<u64>() / known.len() as u64
    }
}
