//! Resume planning.
//!
//! Decides, per file, whether to download from scratch, continue a partial
//! `.part` file with a byte-range request, or skip straight to
//! verification. The planner is pure: it looks only at local `stat`
//! results and the transport's HEAD probe, never at the network.

use crate::transport::ProbeInfo;

/// Minimum partial size worth resuming (2 MiB). Below this a fresh
/// download is cheaper than the extra round trip.
pub const DEFAULT_RESUME_THRESHOLD: u64 = 2 * 1024 * 1024;

/// What the file task should do for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    /// Download the whole body, truncating any local leftovers.
    Fresh,
    /// Continue from `offset` with `Range: bytes=offset-`.
    Resume { offset: u64 },
    /// The final file already has the expected length; only verify it.
    VerifyOnly,
}

/// Local filesystem facts the planner consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalState {
    /// Size of the completed file at `<root>/<name>`, when present.
    pub final_size: Option<u64>,
    /// Size of the sibling `.part` file, when present.
    pub part_size: Option<u64>,
    /// A previous verification of this file failed; local bytes are suspect.
    pub verify_failed: bool,
}

/// Produce a plan for one attempt.
///
/// Invariant: following the returned plan yields a local file whose length
/// equals the probed remote size before verification runs.
pub fn plan(local: LocalState, probe: &ProbeInfo, resume_threshold: u64) -> TransferPlan {
    if local.verify_failed {
        return TransferPlan::Fresh;
    }

    let remote_size = match probe.total_size {
        Some(size) => size,
        // Without a known remote size neither a resume offset nor a
        // skip-to-verify decision can be validated.
        None => return TransferPlan::Fresh,
    };

    if local.final_size == Some(remote_size) {
        return TransferPlan::VerifyOnly;
    }

    if let Some(part) = local.part_size {
        if part < remote_size && part >= resume_threshold && probe.supports_range {
            return TransferPlan::Resume { offset: part };
        }
    }

    TransferPlan::Fresh
}
