//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::resume::DEFAULT_RESUME_THRESHOLD;

/// Default number of concurrently running file tasks.
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

/// Default number of tasks launched per admission batch.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Default transfer attempts per file, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tuning knobs for an [`Engine`](crate::engine::Engine).
///
/// The defaults are sized for manifests in the hundreds-to-thousands
/// range; the transport pool itself adapts per run from the actual
/// selection (see `TransportProfile::for_workload`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where to persist progress. Falls back to the platform user-data
    /// directory when not writable.
    pub state_path: PathBuf,

    /// Base URL for manifests that carry bare digests instead of full
    /// entry URLs.
    pub base_url: Option<String>,

    /// Upper bound on simultaneously running file tasks.
    pub max_concurrency: usize,

    /// Tasks constructed per admission batch.
    pub batch_size: usize,

    /// Retry budget per file.
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,

    /// Ceiling for the exponential backoff.
    pub retry_cap: Duration,

    /// Partial files smaller than this are discarded instead of resumed.
    pub resume_threshold: u64,

    /// Concurrent digest computations on the blocking pool.
    pub hash_parallelism: usize,

    /// Negotiate HTTP/2 via ALPN; hosts still downgrade individually on
    /// hard protocol failures.
    pub prefer_http2: bool,

    /// Drop records whose entries disappeared from the manifest on merge.
    pub prune_on_merge: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("bulkfetch_state.json"),
            base_url: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            resume_threshold: DEFAULT_RESUME_THRESHOLD,
            hash_parallelism: std::thread::available_parallelism()
                .map(|n| n.get().max(4))
                .unwrap_or(4),
            prefer_http2: true,
            prune_on_merge: false,
        }
    }
}

impl EngineConfig {
    /// Clamp nonsense values instead of failing; a zero concurrency or
    /// batch size would deadlock the scheduler.
    pub fn sanitized(mut self) -> Self {
        self.max_concurrency = self.max_concurrency.max(1);
        self.batch_size = self.batch_size.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.hash_parallelism = self.hash_parallelism.max(1);
        self
    }
}
