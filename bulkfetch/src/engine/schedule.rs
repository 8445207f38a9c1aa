//! Admission ordering and batch sizing.

use crate::record::ProgressRecord;

/// Sort work smallest-first so early completions surface quickly, with a
/// stable name tiebreak. Records with unknown size sort last.
pub(crate) fn order_small_first(records: &mut [ProgressRecord]) {
    records.sort_by(|a, b| {
        let ka = a.expected_size.or(a.total_bytes).unwrap_or(u64::MAX);
        let kb = b.expected_size.or(b.total_bytes).unwrap_or(u64::MAX);
        ka.cmp(&kb).then_with(|| a.name.cmp(&b.name))
    });
}

/// Shrink the admission batch when the run is mostly incremental.
///
/// Launching full batches when 95 % of the manifest is already complete
/// just burns construction overhead on tasks that immediately skip.
pub(crate) fn effective_batch_size(base: usize, total: usize, to_download: usize) -> usize {
    if to_download == 0 {
        return 1;
    }

    let mut size = base;
    if to_download <= 10 {
        size = size.min(5);
    } else if to_download <= 50 {
        size = size.min(15);
    }

    if total > 0 {
        let skip_ratio = (total - to_download.min(total)) as f64 / total as f64;
        if skip_ratio > 0.95 {
            size = size.div_ceil(3);
        } else if skip_ratio > 0.8 {
            size = size.div_ceil(2);
        }
    }

    size.max(1)
}
