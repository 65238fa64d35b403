use crate::aggregate::calculate_rate;
use crate::types::{Cell, MeasureRow, MeasureValue, MEASURE_ROUNDING_BASE};

/// Round a count to the nearest multiple of `base`, ties to the even multiple.
///
/// Integer arithmetic only, so large counts and exact halves behave the same
/// way every time. A zero base leaves the count untouched, and a count whose
/// upper multiple would not fit in a `u64` rounds down.
pub fn round_count_to_base(x: u64, base: u64) -> u64 {
    if base == 0 {
        return x;
    }

    let quotient = x / base;
    let remainder = x % base;

    let rounded_quotient = match remainder.cmp(&(base - remainder)) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => {
            if quotient % 2 == 0 {
                quotient
            } else {
                quotient + 1
            }
        }
    };

    rounded_quotient
        .checked_mul(base)
        .unwrap_or(quotient * base)
}

/// Redact a count below `threshold` to zero, then round to the nearest 10
pub fn redact_and_round(count: u64, threshold: u64) -> u64 {
    if count < threshold {
        0
    } else {
        round_count_to_base(count, MEASURE_ROUNDING_BASE)
    }
}

/// Round a table cell to a multiple of `base`.
///
/// NaN stays NaN and labels pass through unchanged, so the same call can run
/// over a column holding both counts and "Other"-style labels.
pub fn round_to_base(cell: &Cell, base: f64) -> Cell {
    match cell {
        Cell::Number(x) if x.is_nan() => Cell::Number(f64::NAN),
        Cell::Number(x) if base > 0.0 => Cell::Number((x / base).round_ties_even() * base),
        other => other.clone(),
    }
}

/// Redact and round both counts of every row in place, then recompute rates.
///
/// A row whose rounded events or population is zero gets the redaction
/// sentinel.
pub fn redact_measure_rows(rows: &mut [MeasureRow], threshold: u64) {
    for row in rows.iter_mut() {
        row.event_measure = redact_and_round(row.event_measure, threshold);
        row.population = redact_and_round(row.population, threshold);
        row.value = if row.event_measure == 0 || row.population == 0 {
            MeasureValue::Redacted
        } else {
            calculate_rate(row.event_measure, row.population)
        };
    }
}
