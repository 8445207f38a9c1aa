//! Per-file progress records.
//!
//! A [`ProgressRecord`] is the persisted unit of state for one manifest
//! entry. Records are created when a manifest is first merged, mutated by
//! the owning file task through the state store, and survive manifest
//! reloads unchanged as long as the entry's identity (URL + expected
//! digest) is stable.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::manifest::{Digest, ManifestEntry};

/// Download lifecycle states.
///
/// `InProgress` never survives a restart: the store demotes it back to
/// `Pending` while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    VerifyFailed,
}

impl DownloadStatus {
    /// Terminal-success states (no bytes left to move).
    pub fn is_done(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::InProgress => "in_progress",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Skipped => "skipped",
            DownloadStatus::VerifyFailed => "verify_failed",
        }
    }
}

/// Verification lifecycle, tracked independently of transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifyState {
    #[default]
    Unverified,
    Verifying,
    Verified,
    VerifyFailed,
}

/// The persisted per-file record.
///
/// Unknown fields written by newer versions are captured in `extra` and
/// re-emitted on save, so round-tripping a state file never drops data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Primary key; never changes once the record exists.
    pub name: String,
    pub url: String,
    pub expected_digest: Digest,
    #[serde(default)]
    pub expected_size: Option<u64>,

    pub status: DownloadStatus,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,

    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,

    /// Path relative to the configured download root.
    pub local_path: String,

    #[serde(default)]
    pub verification: VerifyState,
    #[serde(default)]
    pub verified_digest: Option<String>,
    /// The one corruption-protection refetch after a digest mismatch has
    /// been spent. Renewed only when a manifest merge touches the record.
    #[serde(default)]
    pub verify_refetch_used: bool,

    /// Unix timestamps (seconds).
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    /// Server-side validator from the last response (ETag or Last-Modified).
    #[serde(default)]
    pub last_modified_server: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProgressRecord {
    /// Fresh `Pending` record for a manifest entry.
    pub fn from_entry(entry: &ManifestEntry) -> Self {
        Self {
            name: entry.name.clone(),
            url: entry.url.clone(),
            expected_digest: entry.digest.clone(),
            expected_size: entry.expected_size,
            status: DownloadStatus::Pending,
            bytes_downloaded: 0,
            total_bytes: None,
            attempts: 0,
            last_error: None,
            local_path: entry.name.clone(),
            verification: VerifyState::Unverified,
            verified_digest: None,
            verify_refetch_used: false,
            started_at: None,
            completed_at: None,
            last_modified_server: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Relative path of the sibling `.part` file.
    pub fn part_path(&self) -> String {
        format!("{}.part", self.local_path)
    }

    /// True when a manifest entry still describes the same remote object.
    pub fn matches_entry(&self, entry: &ManifestEntry) -> bool {
        self.url == entry.url && self.expected_digest == entry.digest
    }

    /// Reset transfer state back to `Pending`, optionally keeping the
    /// partial byte count for a later resume.
    pub fn reset(&mut self, keep_partial: bool) {
        self.status = DownloadStatus::Pending;
        self.verification = VerifyState::Unverified;
        self.verified_digest = None;
        self.last_error = None;
        self.completed_at = None;
        if !keep_partial {
            self.bytes_downloaded = 0;
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = DownloadStatus::InProgress;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(now_unix());
        }
    }

    pub fn mark_completed(&mut self, total: u64, digest: Option<String>) {
        self.status = DownloadStatus::Completed;
        self.bytes_downloaded = total;
        self.total_bytes = Some(total);
        if let Some(d) = digest {
            self.verification = VerifyState::Verified;
            self.verified_digest = Some(d);
        }
        self.last_error = None;
        self.completed_at = Some(now_unix());
    }

    /// Like [`mark_completed`], but records that no bytes moved this session.
    ///
    /// [`mark_completed`]: Self::mark_completed
    pub fn mark_skipped(&mut self, total: u64, digest: Option<String>) {
        self.mark_completed(total, digest);
        self.status = DownloadStatus::Skipped;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = DownloadStatus::Failed;
        self.last_error = Some(error.into());
    }

    pub fn mark_verify_failed(&mut self, error: impl Into<String>) {
        self.status = DownloadStatus::VerifyFailed;
        self.verification = VerifyState::VerifyFailed;
        self.verified_digest = None;
        self.bytes_downloaded = 0;
        self.last_error = Some(error.into());
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
