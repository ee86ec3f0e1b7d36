//! Report aggregation over completed lookups.
use std::collections::BTreeMap;

use crate::{ActivityResult, ERROR_BUCKET, ReportEntry};

/// Group results by status label and count them.
///
/// Failed lookups land in the `error` bucket. Output is ordered by label, so the
/// same multiset of results always yields the same sequence.
pub fn aggregate(results: &[ActivityResult]) -> Vec<ReportEntry> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for r in results {
        let label = match &r.outcome {
            Ok(resolution) => resolution.status.label(),
            Err(_) => ERROR_BUCKET,
        };
        *counts.entry(label).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(status, count)| ReportEntry {
            status: status.to_string(),
            count,
        })
        .collect()
}
