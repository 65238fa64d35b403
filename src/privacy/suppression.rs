use tracing::debug;

use crate::types::{CodeCount, OTHER_CODE};

/// How a code table was altered by low-value grouping
#[derive(Debug, Clone, PartialEq)]
pub enum SuppressionOutcome {
    /// Every count was above the threshold
    Unchanged,
    /// Every count was zero, nothing can be published
    AllZero,
    /// Only zero counts were low; they were dropped
    ZerosDropped { dropped: usize },
    /// Low counts were merged; `other` is the residual row if one was emitted
    Grouped { removed: usize, other: Option<u64> },
}

/// Group counts at or below `threshold` into a single "Other" row.
///
/// Rows at or below the threshold are removed and their counts pooled. While
/// the pool is still at or below the threshold the smallest remaining row is
/// pulled in as well (first in input order on ties). The pool is published as
/// an "Other" row only once it exceeds the threshold, so no published count,
/// "Other" included, is ever at or below it.
pub fn group_low_values(counts: &[CodeCount], threshold: u64) -> Vec<CodeCount> {
    let (grouped, outcome) = suppress_with_outcome(counts, threshold);
    debug!(?outcome, codes = counts.len(), "grouped low code counts");
    grouped
}

/// As [`group_low_values`], also reporting what was done
pub fn suppress_with_outcome(
    counts: &[CodeCount],
    threshold: u64,
) -> (Vec<CodeCount>, SuppressionOutcome) {
    let low_total: u64 = counts
        .iter()
        .filter(|c| c.num <= threshold)
        .map(|c| c.num)
        .sum();
    let low_rows = counts.iter().filter(|c| c.num <= threshold).count();

    if low_rows == 0 {
        return (counts.to_vec(), SuppressionOutcome::Unchanged);
    }

    let mut remaining: Vec<CodeCount> = counts
        .iter()
        .filter(|c| c.num > threshold)
        .cloned()
        .collect();

    if low_total == 0 {
        if remaining.is_empty() {
            debug!(rows = counts.len(), "all counts zero; table suppressed");
            return (Vec::new(), SuppressionOutcome::AllZero);
        }
        return (remaining, SuppressionOutcome::ZerosDropped { dropped: low_rows });
    }

    let mut suppressed_total = low_total;
    let mut removed = low_rows;

    while suppressed_total <= threshold {
        let Some(idx) = index_of_min(&remaining) else {
            break;
        };
        let pulled = remaining.remove(idx);
        debug!(code = %pulled.code, "pulled into suppressed total");
        suppressed_total += pulled.num;
        removed += 1;
    }

    let other = if suppressed_total > threshold {
        remaining.push(CodeCount::new(OTHER_CODE, suppressed_total));
        Some(suppressed_total)
    } else {
        None
    };

    (remaining, SuppressionOutcome::Grouped { removed, other })
}

/// Position of the first smallest count
fn index_of_min(rows: &[CodeCount]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, row) in rows.iter().enumerate() {
        match best {
            Some(b) if rows[b].num <= row.num => {}
            _ => best = Some(idx),
        }
    }
    best
}
