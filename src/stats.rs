use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::types::{MeasureRow, PercentileRow};

/// Line style a percentile is drawn with on a decile chart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentileBand {
    /// 50th percentile, solid line
    Median,
    /// 10th, 20th, ... 90th, dashed
    Decile,
    /// 1st-9th and 91st-99th, dotted
    Outer,
}

impl PercentileBand {
    /// Band of a percentile label; `None` for labels the chart never draws
    pub fn of(percentile: u8) -> Option<Self> {
        match percentile {
            50 => Some(PercentileBand::Median),
            10..=90 if percentile % 10 == 0 => Some(PercentileBand::Decile),
            1..=9 | 91..=99 => Some(PercentileBand::Outer),
            _ => None,
        }
    }
}

/// Percentile labels to compute: deciles, plus the tails when `outer` is set
pub fn percentile_levels(outer: bool) -> Vec<u8> {
    (1..=99)
        .filter(|&p| match PercentileBand::of(p) {
            Some(PercentileBand::Outer) => outer,
            Some(_) => true,
            None => false,
        })
        .collect()
}

/// Quantile of already sorted values by linear interpolation between order
/// statistics (`pos = q * (n - 1)`)
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }

    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let (a, b) = (sorted[lo], sorted[hi]);

    if lo == hi {
        return Some(a);
    }

    let frac = pos - lo as f64;
    // clamp so float error never steps outside [a, b]
    Some((a + (b - a) * frac).clamp(a, b))
}

/// Percentiles of one set of values, labelled 1-99
pub fn percentiles_of(values: &[f64], outer: bool) -> Vec<(u8, f64)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Vec::new();
    }
    sorted.sort_by(f64::total_cmp);

    percentile_levels(outer)
        .into_iter()
        .filter_map(|p| quantile(&sorted, p as f64 / 100.0).map(|v| (p, v)))
        .collect()
}

/// Deciles (and optionally outer percentiles) of the rate in each period.
///
/// Redacted rows carry no rate and are left out; a period without any rate
/// contributes no rows. Output is ordered by period, then percentile.
pub fn compute_percentiles(rows: &[MeasureRow], outer: bool) -> Vec<PercentileRow> {
    let mut by_period: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for row in rows {
        if let Some(rate) = row.value.rate() {
            by_period.entry(row.period).or_default().push(rate);
        }
    }

    by_period
        .into_iter()
        .flat_map(|(period, values)| {
            percentiles_of(&values, outer)
                .into_iter()
                .map(move |(percentile, value)| PercentileRow {
                    period,
                    percentile,
                    value,
                })
        })
        .collect()
}
