//! Engine-to-embedder event plumbing.
//!
//! The engine reports progress and log lines through callbacks registered
//! via `Engine::subscribe`. Callbacks run on the engine's executor and
//! must not block.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::record::DownloadStatus;

/// One debounced progress report for a single file.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub name: String,
    pub status: DownloadStatus,
    /// Decoded bytes written so far.
    pub bytes_downloaded: u64,
    /// Decoded total, once known.
    pub total_bytes: Option<u64>,
    /// Smoothed instantaneous rate in bytes per second.
    pub rate_bps: f64,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Cloneable fan-out handle shared by the engine, its tasks and the state
/// store's checkpointer.
#[derive(Clone, Default)]
pub struct EventSink {
    inner: Arc<Mutex<Subscribers>>,
}

#[derive(Default)]
struct Subscribers {
    progress: Vec<ProgressCallback>,
    log: Vec<LogCallback>,
}

impl EventSink {
    pub fn subscribe(&self, progress: Option<ProgressCallback>, log: Option<LogCallback>) {
        let mut inner = self.inner.lock();
        if let Some(cb) = progress {
            inner.progress.push(cb);
        }
        if let Some(cb) = log {
            inner.log.push(cb);
        }
    }

    pub fn progress(&self, update: &ProgressUpdate) {
        // Clone the callback list out so a slow subscriber list mutation
        // can't deadlock with an emitting task.
        let callbacks: Vec<ProgressCallback> = self.inner.lock().progress.clone();
        for cb in callbacks {
            cb(update);
        }
    }

    pub fn log(&self, message: &str) {
        let callbacks: Vec<LogCallback> = self.inner.lock().log.clone();
        for cb in callbacks {
            cb(message);
        }
    }
}
