//! Integrity verification.
//!
//! Streams a file through the digest declared by the manifest (MD5, SHA-1
//! or SHA-256) and compares against the expected hex value. Hashing is CPU
//! work, so it runs on the blocking pool behind a small semaphore instead
//! of the I/O executor. Results are cached in memory, keyed by the file's
//! path, size and mtime, which makes re-verifying a large Completed set on
//! startup a metadata-only operation.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use md5::Md5;
use parking_lot::Mutex;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::manifest::{Digest, DigestAlgorithm};

/// Read buffer for streaming digests (64 KiB).
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Errors raised while verifying a local file.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The computed digest does not match the expected one.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    /// The file is missing or unreadable.
    #[error("file unavailable for verification: {0}")]
    Unavailable(#[from] std::io::Error),

    /// The blocking hash task was torn down mid-flight.
    #[error("hashing task aborted")]
    Aborted,
}

#[derive(PartialEq, Eq, Hash, Clone)]
struct CacheKey {
    path: PathBuf,
    len: u64,
    mtime_ns: u128,
    algorithm: DigestAlgorithm,
}

/// Digest computer with a metadata-keyed result cache.
///
/// The cache lives for the process lifetime and is never persisted; any
/// change to a file's size or mtime invalidates its entry by construction
/// of the key.
pub struct Verifier {
    cache: Mutex<HashMap<CacheKey, String>>,
    permits: Arc<Semaphore>,
}

impl Verifier {
    /// `parallelism` bounds how many digests may run concurrently on the
    /// blocking pool.
    pub fn new(parallelism: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    /// Compute the hex digest of `path` under `algorithm`.
    pub async fn digest(
        &self,
        path: &Path,
        algorithm: DigestAlgorithm,
    ) -> Result<String, VerifyError> {
        let meta = tokio::fs::metadata(path).await?;
        let key = CacheKey {
            path: path.to_path_buf(),
            len: meta.len(),
            mtime_ns: meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
            algorithm,
        };

        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            debug!(path = %path.display(), "digest cache hit");
            return Ok(hit);
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VerifyError::Aborted)?;

        let hash_path = path.to_path_buf();
        let computed =
            tokio::task::spawn_blocking(move || hash_file(&hash_path, algorithm))
                .await
                .map_err(|_| VerifyError::Aborted)??;

        self.cache.lock().insert(key, computed.clone());
        Ok(computed)
    }

    /// Digest `path` and compare against `expected`, returning the computed
    /// hex value on success.
    pub async fn verify(&self, path: &Path, expected: &Digest) -> Result<String, VerifyError> {
        let actual = self.digest(path, expected.algorithm).await?;
        if constant_time_eq(&actual, &expected.value) {
            Ok(actual)
        } else {
            Err(VerifyError::Mismatch {
                expected: expected.value.clone(),
                actual,
            })
        }
    }

    /// Drop a cached digest, e.g. after truncating a corrupt file.
    pub fn invalidate(&self, path: &Path) {
        self.cache.lock().retain(|key, _| key.path != path);
    }
}

fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> Result<String, std::io::Error> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    // One loop per algorithm keeps the hasher monomorphic.
    macro_rules! stream_into {
        ($hasher:expr) => {{
            let mut hasher = $hasher;
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hex::encode(hasher.finalize())
        }};
    }

    Ok(match algorithm {
        DigestAlgorithm::Md5 => stream_into!(Md5::new()),
        DigestAlgorithm::Sha1 => stream_into!(Sha1::new()),
        DigestAlgorithm::Sha256 => stream_into!(Sha256::new()),
    })
}

/// Constant-time comparison over the hex strings.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
