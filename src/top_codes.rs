use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::privacy::{group_low_values, round_to_base};
use crate::types::{
    Cell, CodeCount, CodelistEntry, ExtractRecord, DEFAULT_LOW_COUNT_THRESHOLD,
    DEFAULT_TOP_CODE_ROUNDING_BASE, DEFAULT_TOP_N, OTHER_CODE,
};

/// Description shown for "Other" and for codes missing from the codelist
pub const NO_DESCRIPTION: &str = "-";

/// Share of all recorded codes taken by one code
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proportion {
    /// Percentage rounded to two decimals
    Percent(f64),
    /// No codes recorded at all
    Missing,
    /// Non-zero count that rounds to 0.00%
    BelowMinimum,
    /// Count short of the total that rounds to 100.00%
    AboveMaximum,
}

impl Proportion {
    fn sort_key(&self) -> f64 {
        match self {
            Proportion::Percent(p) => *p,
            Proportion::Missing => f64::NEG_INFINITY,
            Proportion::BelowMinimum => 0.0,
            Proportion::AboveMaximum => 100.0,
        }
    }
}

impl fmt::Display for Proportion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proportion::Percent(p) => write!(f, "{:.2}", p),
            Proportion::Missing => Ok(()),
            Proportion::BelowMinimum => f.write_str("<0.001"),
            Proportion::AboveMaximum => f.write_str(">99.99"),
        }
    }
}

impl Serialize for Proportion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One line of a top-code table
#[derive(Debug, Clone, PartialEq)]
pub struct TopCodeRow {
    pub code: String,
    pub num: u64,
    pub description: String,
    pub proportion: Proportion,
}

/// Disclosure settings for a top-code table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopCodeSettings {
    pub low_count_threshold: u64,
    pub rounding_base: u64,
    pub top_n: usize,
}

impl Default for TopCodeSettings {
    fn default() -> Self {
        Self {
            low_count_threshold: DEFAULT_LOW_COUNT_THRESHOLD,
            rounding_base: DEFAULT_TOP_CODE_ROUNDING_BASE,
            top_n: DEFAULT_TOP_N,
        }
    }
}

/// A published top-code table and the full table kept for output checking
#[derive(Debug, Clone, PartialEq)]
pub struct TopCodeTables {
    pub top: Vec<TopCodeRow>,
    pub with_counts: Vec<TopCodeRow>,
}

/// Build the most frequently recorded codes table.
///
/// Low counts are grouped into "Other", every count is rounded, and the
/// proportions are computed from the rounded counts so the published shares
/// are consistent with what was released.
pub fn create_top_code_table(
    counts: &[CodeCount],
    codelist: &[CodelistEntry],
    settings: &TopCodeSettings,
) -> TopCodeTables {
    let grouped = group_low_values(counts, settings.low_count_threshold);

    let rounded: Vec<CodeCount> = grouped
        .into_iter()
        .map(|c| {
            let num = round_num(c.num, settings.rounding_base);
            CodeCount::new(c.code, num)
        })
        .collect();
    debug!(rows = rounded.len(), base = settings.rounding_base, "rounded code counts");

    let total: u64 = rounded.iter().map(|c| c.num).sum();
    let terms: HashMap<&str, &str> = codelist
        .iter()
        .map(|e| (e.code.as_str(), e.term.as_str()))
        .collect();

    let mut rows: Vec<TopCodeRow> = rounded
        .into_iter()
        .map(|c| {
            let description = if c.code == OTHER_CODE {
                NO_DESCRIPTION.to_string()
            } else {
                terms
                    .get(c.code.as_str())
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| NO_DESCRIPTION.to_string())
            };
            let proportion = proportion_of(c.num, total);
            TopCodeRow {
                code: c.code,
                num: c.num,
                description,
                proportion,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.proportion.sort_key().total_cmp(&a.proportion.sort_key()));

    let top = rows.iter().take(settings.top_n).cloned().collect();
    TopCodeTables {
        top,
        with_counts: rows,
    }
}

/// Round one `num` cell of the table
fn round_num(num: u64, base: u64) -> u64 {
    match round_to_base(&Cell::Number(num as f64), base as f64) {
        Cell::Number(x) => x as u64,
        Cell::Label(_) => num,
    }
}

/// Add each record's `count_<code>` values into `totals`
pub fn sum_code_counts<'a>(
    records: impl IntoIterator<Item = &'a ExtractRecord>,
    totals: &mut BTreeMap<String, u64>,
) {
    for record in records {
        for (code, num) in &record.code_counts {
            *totals.entry(code.clone()).or_insert(0) += num;
        }
    }
}

/// Counts of the codes that belong to `codelist`, in code order
pub fn counts_for_codelist(
    totals: &BTreeMap<String, u64>,
    codelist: &[CodelistEntry],
) -> Vec<CodeCount> {
    let codes: HashSet<&str> = codelist.iter().map(|e| e.code.as_str()).collect();
    totals
        .iter()
        .filter(|(code, _)| codes.contains(code.as_str()))
        .map(|(code, &num)| CodeCount::new(code.clone(), num))
        .collect()
}

/// Percentage of `total`, with the 0% and 100% edge cases labelled
fn proportion_of(num: u64, total: u64) -> Proportion {
    if total == 0 {
        return Proportion::Missing;
    }

    let percent = (num as f64 / total as f64 * 100.0 * 100.0).round_ties_even() / 100.0;

    if percent == 0.0 && num > 0 {
        Proportion::BelowMinimum
    } else if percent == 100.0 && num < total {
        Proportion::AboveMaximum
    } else {
        Proportion::Percent(percent)
    }
}
