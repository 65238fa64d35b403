use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::MeasureRow;

/// Redaction rate of one breakdown category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedactionCheck {
    pub group: String,
    pub group_value: String,
    pub redacted: usize,
    pub total: usize,
    pub fraction: f64,
    pub passes: bool,
}

/// Check each category's share of redacted periods against `max_fraction`.
///
/// Categories are keyed by `(group, group_value)` so that a table holding
/// several breakdowns never pools, say, IMD quintile "1" with another
/// breakdown's "1". Results come back in key order.
pub fn validate_redaction_rate(rows: &[MeasureRow], max_fraction: f64) -> Vec<RedactionCheck> {
    let mut tallies: BTreeMap<(&str, &str), (usize, usize)> = BTreeMap::new();

    for row in rows {
        let entry = tallies
            .entry((row.group.as_str(), row.group_value.as_str()))
            .or_insert((0, 0));
        if row.value.is_redacted() {
            entry.0 += 1;
        }
        entry.1 += 1;
    }

    tallies
        .into_iter()
        .map(|((group, group_value), (redacted, total))| {
            let fraction = if total == 0 {
                0.0
            } else {
                redacted as f64 / total as f64
            };
            RedactionCheck {
                group: group.to_string(),
                group_value: group_value.to_string(),
                redacted,
                total,
                fraction,
                passes: fraction <= max_fraction,
            }
        })
        .collect()
}

/// Keep only rows whose category passes the redaction gate
pub fn drop_redacted_groups(rows: &[MeasureRow], max_fraction: f64) -> Vec<MeasureRow> {
    let failing: Vec<(String, String)> = validate_redaction_rate(rows, max_fraction)
        .into_iter()
        .filter(|c| !c.passes)
        .map(|c| (c.group, c.group_value))
        .collect();

    rows.iter()
        .filter(|r| {
            !failing
                .iter()
                .any(|(g, v)| *g == r.group && *v == r.group_value)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MeasureValue, DEFAULT_MAX_REDACTED_FRACTION};
    use chrono::NaiveDate;

    fn rows_for(group_value: &str, redacted: usize, total: usize) -> Vec<MeasureRow> {
        (0..total)
            .map(|i| MeasureRow {
                period: NaiveDate::from_ymd_opt(2022, 1 + i as u32, 1).unwrap(),
                event_measure: 10,
                population: 100,
                group: "region".to_string(),
                group_value: group_value.to_string(),
                value: if i < redacted {
                    MeasureValue::Redacted
                } else {
                    MeasureValue::Rate(100.0)
                },
            })
            .collect()
    }

    #[test]
    fn test_six_of_ten_fails() {
        let checks = validate_redaction_rate(&rows_for("X", 6, 10), DEFAULT_MAX_REDACTED_FRACTION);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].redacted, 6);
        assert!((checks[0].fraction - 0.6).abs() < 1e-12);
        assert!(!checks[0].passes);
    }

    #[test]
    fn test_exactly_half_passes() {
        let checks = validate_redaction_rate(&rows_for("Y", 5, 10), DEFAULT_MAX_REDACTED_FRACTION);
        assert!(checks[0].passes);
    }

    #[test]
    fn test_drop_failing_groups() {
        let mut rows = rows_for("X", 6, 10);
        rows.extend(rows_for("Y", 1, 10));

        let kept = drop_redacted_groups(&rows, DEFAULT_MAX_REDACTED_FRACTION);

        assert_eq!(kept.len(), 10);
        assert!(kept.iter().all(|r| r.group_value == "Y"));
    }

    #[test]
    fn test_groups_scoped_by_breakdown() {
        let mut rows = rows_for("1", 10, 10);
        let mut other = rows_for("1", 0, 10);
        for r in &mut other {
            r.group = "imd".to_string();
        }
        rows.extend(other);

        let checks = validate_redaction_rate(&rows, DEFAULT_MAX_REDACTED_FRACTION);
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().any(|c| c.group == "imd" && c.passes));
        assert!(checks.iter().any(|c| c.group == "region" && !c.passes));
    }
}
