//! bulkfetch - bulk asset download engine.
//!
//! Fetches large numbers of remote files listed in a JSON manifest, with
//! durable progress tracking, integrity verification, resumable transfers
//! and adaptive transport tuning (HTTP/2 with per-host HTTP/1.1
//! downgrade).
//!
//! The embedder-facing surface is [`Engine`]: load a manifest, point it at
//! a download root, subscribe to progress, and start. Everything else -
//! transport, resume planning, verification, the state store - is public
//! for embedders that need finer control or want to inject a mock
//! transport in tests.

pub mod config;
pub mod engine;
pub mod events;
pub mod manifest;
pub mod policy;
pub mod record;
pub mod resume;
pub mod state;
pub mod stats;
pub mod transport;
pub mod verify;

mod task;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, RunSummary};
pub use events::{LogCallback, ProgressCallback, ProgressUpdate};
pub use manifest::{Digest, DigestAlgorithm, Manifest, ManifestEntry, ManifestError};
pub use record::{DownloadStatus, ProgressRecord, VerifyState};
pub use state::{MergeDiff, StateError, StateStore};
pub use stats::{format_size, StatsSnapshot};
pub use transport::{
    BoxFuture, ByteStream, FallbackTransport, FetchRequest, HttpTransport, ProbeInfo, Protocol,
    Transport, TransportError, TransportProfile, TransportResponse,
};
pub use verify::{Verifier, VerifyError};
