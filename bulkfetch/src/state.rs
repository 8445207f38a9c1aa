//! Durable progress state.
//!
//! The [`StateStore`] owns the authoritative record set: a JSON file
//! mapping entry names to [`ProgressRecord`]s. File tasks never touch
//! records directly; they request mutations through [`StateStore::update`],
//! which serialises writers and schedules a coalesced checkpoint.
//!
//! Checkpoints are atomic: the record set is serialised to a sibling
//! temporary file, flushed, and renamed over the target. A background
//! checkpointer task batches mutations so the file is rewritten at most
//! once per second, with one final checkpoint on shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::EventSink;
use crate::manifest::Manifest;
use crate::record::{DownloadStatus, ProgressRecord, VerifyState};

/// Version written to new state files. Files claiming a newer version are
/// refused so an older build cannot silently destroy fields it does not
/// understand.
pub const STATE_VERSION: u32 = 1;

/// Coalescing window between checkpoints.
const CHECKPOINT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Consecutive write failures tolerated before the error is surfaced.
const MAX_WRITE_FAILURES: u32 = 3;

/// Errors from loading or persisting the state file.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("state file version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// On-disk shape of the store.
#[derive(serde::Serialize, serde::Deserialize)]
struct StateFile {
    version: u32,
    records: Vec<ProgressRecord>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of reconciling a fresh manifest against prior state.
#[derive(Debug, Default, Clone)]
pub struct MergeDiff {
    /// New entries with no prior record.
    pub added: Vec<String>,
    /// Entries whose URL or digest changed; their records were reset.
    pub updated: Vec<String>,
    /// Records absent from the manifest (pruned only on request).
    pub removed: Vec<String>,
    /// Entries whose records survived untouched.
    pub preserved: Vec<String>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ProgressRecord>>,
    extra: Mutex<serde_json::Map<String, serde_json::Value>>,
    dirty: Notify,
    write_failures: AtomicU32,
}

/// Durable mapping from file identity to progress record.
#[derive(Clone, Debug)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Open the store at `path`, loading existing records.
    ///
    /// If `path` is not writable the store falls back, once, to the
    /// platform user-data directory. Any persisted `InProgress` record is
    /// healed to `Pending`: a record can only be mid-transfer while a task
    /// owns it, and no task survives a restart.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = resolve_writable(path.into());

        let (records, extra) = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                (BTreeMap::new(), serde_json::Map::new())
            } else {
                let file: StateFile = serde_json::from_str(&text)?;
                if file.version > STATE_VERSION {
                    return Err(StateError::UnsupportedVersion {
                        found: file.version,
                        supported: STATE_VERSION,
                    });
                }
                let mut map = BTreeMap::new();
                for mut record in file.records {
                    heal(&mut record);
                    map.insert(record.name.clone(), record);
                }
                (map, file.extra)
            }
        } else {
            (BTreeMap::new(), serde_json::Map::new())
        };

        info!(path = %path.display(), records = records.len(), "state store opened");
        Ok(Self::from_parts(path, records, extra))
    }

    /// Open with an empty record set, ignoring whatever is on disk. Used
    /// when the embedder chooses to discard a corrupt state file.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        let path = resolve_writable(path.into());
        Self::from_parts(path, BTreeMap::new(), serde_json::Map::new())
    }

    fn from_parts(
        path: PathBuf,
        records: BTreeMap<String, ProgressRecord>,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path,
                records: Mutex::new(records),
                extra: Mutex::new(extra),
                dirty: Notify::new(),
                write_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Resolved state file location.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Reconcile a fresh manifest with the existing records.
    ///
    /// Matching identity (URL and expected digest unchanged) preserves the
    /// record, including `Completed` status: a manifest reload never forces
    /// a redownload of finished work. Records missing from the manifest
    /// are kept unless `prune` is set.
    pub async fn merge(&self, manifest: &Manifest, prune: bool) -> MergeDiff {
        let mut records = self.inner.records.lock().await;
        let mut diff = MergeDiff::default();

        for entry in manifest.entries() {
            match records.get_mut(&entry.name) {
                Some(record) if record.matches_entry(entry) => {
                    // Size is a hint; keep it current without disturbing
                    // status. A fresh manifest load also renews the
                    // one-shot corruption-protection refetch.
                    record.expected_size = entry.expected_size;
                    record.verify_refetch_used = false;
                    diff.preserved.push(entry.name.clone());
                }
                Some(record) => {
                    let mut fresh = ProgressRecord::from_entry(entry);
                    fresh.extra = std::mem::take(&mut record.extra);
                    *record = fresh;
                    diff.updated.push(entry.name.clone());
                }
                None => {
                    records.insert(entry.name.clone(), ProgressRecord::from_entry(entry));
                    diff.added.push(entry.name.clone());
                }
            }
        }

        let stale: Vec<String> = records
            .keys()
            .filter(|name| !manifest.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if prune {
                records.remove(&name);
            }
            diff.removed.push(name);
        }

        drop(records);
        self.mark_dirty();
        debug!(
            added = diff.added.len(),
            updated = diff.updated.len(),
            preserved = diff.preserved.len(),
            removed = diff.removed.len(),
            prune,
            "manifest merged"
        );
        diff
    }

    /// Apply a mutation to one record under the single-writer lock and
    /// schedule a checkpoint. Returns false when the record does not exist.
    pub async fn update<F>(&self, name: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ProgressRecord),
    {
        let mut records = self.inner.records.lock().await;
        let Some(record) = records.get_mut(name) else {
            return false;
        };
        mutate(record);
        drop(records);
        self.mark_dirty();
        true
    }

    /// Copy of one record.
    pub async fn get(&self, name: &str) -> Option<ProgressRecord> {
        self.inner.records.lock().await.get(name).cloned()
    }

    /// Consistent copy of all records.
    pub async fn snapshot(&self) -> Vec<ProgressRecord> {
        self.inner.records.lock().await.values().cloned().collect()
    }

    /// Record counts keyed by status name.
    pub async fn counts_by_state(&self) -> BTreeMap<&'static str, usize> {
        let records = self.inner.records.lock().await;
        let mut counts = BTreeMap::new();
        for record in records.values() {
            *counts.entry(record.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Names of records worth running: everything that is not already
    /// completed or skipped.
    pub async fn pending_names(&self) -> Vec<String> {
        self.inner
            .records
            .lock()
            .await
            .values()
            .filter(|r| !r.status.is_done())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Align healed partial byte counts with what is actually on disk
    /// under `root`: a preserved count is only trustworthy when a `.part`
    /// file of exactly that size exists.
    pub async fn reconcile_partials(&self, root: &Path) {
        let mut records = self.inner.records.lock().await;
        let mut changed = false;

        for record in records.values_mut() {
            if record.status != DownloadStatus::Pending || record.bytes_downloaded == 0 {
                continue;
            }
            let part = root.join(record.part_path());
            let on_disk = std::fs::metadata(&part).map(|m| m.len()).ok();
            if on_disk != Some(record.bytes_downloaded) {
                debug!(
                    name = %record.name,
                    recorded = record.bytes_downloaded,
                    on_disk = on_disk.unwrap_or(0),
                    "partial byte count did not match .part file, resetting"
                );
                record.bytes_downloaded = 0;
                changed = true;
            }
        }

        drop(records);
        if changed {
            self.mark_dirty();
        }
    }

    /// Drop all records and delete the state file.
    pub async fn clear(&self) -> Result<(), StateError> {
        self.inner.records.lock().await.clear();
        self.inner.extra.lock().await.clear();
        match std::fs::remove_file(&self.inner.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the current record set to disk atomically.
    pub async fn checkpoint(&self) -> Result<(), StateError> {
        let file = {
            let records = self.inner.records.lock().await;
            let extra = self.inner.extra.lock().await;
            StateFile {
                version: STATE_VERSION,
                records: records.values().cloned().collect(),
                extra: extra.clone(),
            }
        };

        let payload = serde_json::to_vec_pretty(&file)?;
        let tmp = self.inner.path.with_extension("json.tmp");

        if let Some(parent) = self.inner.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut out = tokio::fs::File::create(&tmp).await?;
        out.write_all(&payload).await?;
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &self.inner.path).await?;

        self.inner.write_failures.store(0, Ordering::Relaxed);
        debug!(records = file.records.len(), "checkpoint written");
        Ok(())
    }

    /// Run the coalescing checkpoint loop until `shutdown` fires.
    ///
    /// The engine spawns this once per run and issues one final explicit
    /// [`checkpoint`](Self::checkpoint) after the loop exits.
    pub fn spawn_checkpointer(
        &self,
        shutdown: CancellationToken,
        events: EventSink,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = store.inner.dirty.notified() => {
                        // Batch every mutation that lands inside the window.
                        tokio::time::sleep(CHECKPOINT_INTERVAL).await;
                        if let Err(e) = store.checkpoint().await {
                            let failures =
                                store.inner.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(%e, failures, "checkpoint failed, will retry on next tick");
                            if failures >= MAX_WRITE_FAILURES {
                                error!(%e, "state file is not persisting");
                                events.log(&format!(
                                    "state file is not persisting after {failures} attempts: {e}"
                                ));
                            }
                            // Re-arm so the next tick retries even without
                            // new mutations.
                            store.mark_dirty();
                        }
                    }
                }
            }
        })
    }

    fn mark_dirty(&self) {
        self.inner.dirty.notify_one();
    }
}

/// Demote a persisted `InProgress` record: the byte count is kept for
/// [`StateStore::reconcile_partials`] to confirm, the status cannot be
/// trusted. `Verifying` likewise rolls back to `Unverified`.
fn heal(record: &mut ProgressRecord) {
    if record.status == DownloadStatus::InProgress {
        record.status = DownloadStatus::Pending;
    }
    if record.verification == VerifyState::Verifying {
        record.verification = VerifyState::Unverified;
    }
}

/// Pick a writable location for the state file, falling back to the
/// platform user-data directory (resolved once, here).
fn resolve_writable(requested: PathBuf) -> PathBuf {
    if probe_writable(&requested) {
        return requested;
    }

    let file_name = requested
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "bulkfetch_state.json".into());
    let fallback = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bulkfetch")
        .join(file_name);

    warn!(
        requested = %requested.display(),
        fallback = %fallback.display(),
        "state path is not writable, using user-data directory"
    );
    fallback
}

fn probe_writable(path: &Path) -> bool {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && std::fs::create_dir_all(parent).is_err() {
            return false;
        }
    }
    if path.exists() {
        return std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .is_ok();
    }
    // Probe with a create-then-remove so a stale zero-byte file is not
    // left behind on the happy path.
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(path);
            true
        }
        Err(_) => false,
    }
}
