use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tracing::debug;

use crate::privacy::redact_measure_rows;
use crate::types::{
    ExtractRecord, MeasureRow, MeasureValue, PRACTICE_GROUP, RATE_PER, TOTAL_GROUP,
};

/// Events per 1000 population; a zero population gives the sentinel
pub fn calculate_rate(event_measure: u64, population: u64) -> MeasureValue {
    if population == 0 {
        MeasureValue::Redacted
    } else {
        MeasureValue::Rate(event_measure as f64 / population as f64 * RATE_PER)
    }
}

/// Sum events and population over every record of a period
pub fn aggregate_total(records: &[ExtractRecord], period: NaiveDate) -> MeasureRow {
    let (event_measure, population) = sum_counts(records.iter());
    MeasureRow {
        period,
        event_measure,
        population,
        group: TOTAL_GROUP.to_string(),
        group_value: TOTAL_GROUP.to_string(),
        value: calculate_rate(event_measure, population),
    }
}

/// One row per observed value of `dimension`, in group_value order.
///
/// Records missing the dimension are not counted in any category.
pub fn aggregate_by(records: &[ExtractRecord], dimension: &str, period: NaiveDate) -> Vec<MeasureRow> {
    let mut groups: BTreeMap<&str, (u64, u64)> = BTreeMap::new();

    for record in records {
        if let Some(value) = record.category(dimension) {
            let entry = groups.entry(value).or_insert((0, 0));
            entry.0 += record.event_measure;
            entry.1 += record.population;
        }
    }

    groups
        .into_iter()
        .map(|(group_value, (event_measure, population))| MeasureRow {
            period,
            event_measure,
            population,
            group: dimension.to_string(),
            group_value: group_value.to_string(),
            value: calculate_rate(event_measure, population),
        })
        .collect()
}

/// Stable sort by period, then group_value
pub fn sort_measure_rows(rows: &mut [MeasureRow]) {
    rows.sort_by(|a, b| {
        a.period
            .cmp(&b.period)
            .then_with(|| a.group_value.cmp(&b.group_value))
    });
}

/// Keep records whose value for each filtered column is allowed.
///
/// Filters naming a column the extract does not have are ignored.
pub fn filter_records(
    records: Vec<ExtractRecord>,
    filters: &BTreeMap<String, Vec<String>>,
    columns: &[String],
) -> Vec<ExtractRecord> {
    let active: Vec<(&String, &Vec<String>)> = filters
        .iter()
        .filter(|(column, _)| columns.contains(column))
        .collect();

    if active.is_empty() {
        return records;
    }

    records
        .into_iter()
        .filter(|record| {
            active.iter().all(|(column, allowed)| {
                record
                    .category(column)
                    .map(|v| allowed.iter().any(|a| a == v))
                    .unwrap_or(false)
            })
        })
        .collect()
}

fn sum_counts<'a>(records: impl Iterator<Item = &'a ExtractRecord>) -> (u64, u64) {
    records.fold((0, 0), |(events, population), r| {
        (events + r.event_measure, population + r.population)
    })
}

/// Measure rows of one run, collected period by period
#[derive(Debug, Clone, Default)]
pub struct MeasureSet {
    breakdowns: Vec<String>,
    total: Vec<MeasureRow>,
    by_breakdown: HashMap<String, Vec<MeasureRow>>,
}

impl MeasureSet {
    /// Tables for `total` and each distinct breakdown, in first-seen order
    pub fn new(breakdowns: &[String]) -> Self {
        let mut distinct: Vec<String> = Vec::with_capacity(breakdowns.len());
        for breakdown in breakdowns {
            if !distinct.contains(breakdown) {
                distinct.push(breakdown.clone());
            }
        }

        Self {
            breakdowns: distinct,
            total: Vec::new(),
            by_breakdown: breakdowns
                .iter()
                .map(|b| (b.clone(), Vec::new()))
                .collect(),
        }
    }

    /// Aggregate one period's records into every table
    pub fn add_period(&mut self, period: NaiveDate, records: &[ExtractRecord]) {
        self.total.push(aggregate_total(records, period));
        for breakdown in &self.breakdowns {
            let rows = aggregate_by(records, breakdown, period);
            debug!(%period, breakdown = %breakdown, categories = rows.len(), "aggregated");
            if let Some(table) = self.by_breakdown.get_mut(breakdown) {
                table.extend(rows);
            }
        }
    }

    /// Sort and redact every table.
    ///
    /// The practice breakdown stays unredacted because it is only published
    /// as percentiles. Returns `(name, rows)` with "total" first, then the
    /// breakdowns in the order they were requested.
    pub fn finalize(mut self, threshold: u64) -> Vec<(String, Vec<MeasureRow>)> {
        let mut tables = Vec::with_capacity(self.breakdowns.len() + 1);

        let mut total = std::mem::take(&mut self.total);
        sort_measure_rows(&mut total);
        redact_measure_rows(&mut total, threshold);
        tables.push((TOTAL_GROUP.to_string(), total));

        for breakdown in &self.breakdowns {
            let mut rows = self.by_breakdown.remove(breakdown).unwrap_or_default();
            sort_measure_rows(&mut rows);
            if breakdown != PRACTICE_GROUP {
                redact_measure_rows(&mut rows, threshold);
            }
            tables.push((breakdown.clone(), rows));
        }

        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_REDACTION_THRESHOLD;

    fn date(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, m, 1).unwrap()
    }

    fn record(event_measure: u64, sex: Option<&str>, practice: &str) -> ExtractRecord {
        let mut r = ExtractRecord {
            event_measure,
            population: 1,
            ..Default::default()
        };
        if let Some(sex) = sex {
            r.categories.insert("sex".to_string(), sex.to_string());
        }
        r.categories.insert("practice".to_string(), practice.to_string());
        r
    }

    #[test]
    fn test_zero_population_rate_redacted() {
        assert_eq!(calculate_rate(0, 0), MeasureValue::Redacted);
        assert_eq!(calculate_rate(0, 10), MeasureValue::Rate(0.0));
        assert_eq!(calculate_rate(5, 20), MeasureValue::Rate(250.0));
    }

    #[test]
    fn test_aggregate_total() {
        let records = vec![record(1, Some("M"), "A"), record(0, Some("F"), "A"), record(1, None, "B")];
        let row = aggregate_total(&records, date(1));

        assert_eq!(row.group, "total");
        assert_eq!(row.group_value, "total");
        assert_eq!(row.event_measure, 2);
        assert_eq!(row.population, 3);
    }

    #[test]
    fn test_aggregate_total_empty() {
        let row = aggregate_total(&[], date(1));
        assert_eq!(row.event_measure, 0);
        assert_eq!(row.population, 0);
        assert_eq!(row.value, MeasureValue::Redacted);
    }

    #[test]
    fn test_aggregate_by_dimension() {
        let records = vec![
            record(1, Some("M"), "A"),
            record(0, Some("M"), "A"),
            record(1, Some("F"), "B"),
            record(1, None, "B"),
        ];
        let rows = aggregate_by(&records, "sex", date(2));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].group_value, "F");
        assert_eq!((rows[0].event_measure, rows[0].population), (1, 1));
        assert_eq!(rows[1].group_value, "M");
        assert_eq!((rows[1].event_measure, rows[1].population), (1, 2));
        assert!(rows.iter().all(|r| r.group == "sex" && r.period == date(2)));
    }

    #[test]
    fn test_aggregate_by_zero_group() {
        let records = vec![ExtractRecord {
            event_measure: 0,
            population: 0,
            categories: [("sex".to_string(), "F".to_string())].into_iter().collect(),
            ..Default::default()
        }];
        let rows = aggregate_by(&records, "sex", date(1));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, MeasureValue::Redacted);
    }

    #[test]
    fn test_sort_by_period_then_value() {
        let mut rows = aggregate_by(&[record(1, Some("M"), "A")], "sex", date(3));
        rows.extend(aggregate_by(&[record(1, Some("M"), "A"), record(1, Some("F"), "A")], "sex", date(1)));
        sort_measure_rows(&mut rows);

        let keys: Vec<_> = rows.iter().map(|r| (r.period, r.group_value.as_str())).collect();
        assert_eq!(keys, vec![(date(1), "F"), (date(1), "M"), (date(3), "M")]);
    }

    #[test]
    fn test_filter_records() {
        let filters: BTreeMap<String, Vec<String>> = [
            ("sex".to_string(), vec!["M".to_string(), "F".to_string()]),
            ("age_band".to_string(), vec!["18-19".to_string()]),
        ]
        .into_iter()
        .collect();
        let columns = vec!["sex".to_string(), "practice".to_string()];

        let records = vec![record(1, Some("M"), "A"), record(1, Some("U"), "A"), record(1, None, "A")];
        let kept = filter_records(records, &filters, &columns);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].category("sex"), Some("M"));
    }

    #[test]
    fn test_measure_set_repeated_breakdown_counted_once() {
        let breakdowns = vec!["sex".to_string(), "sex".to_string()];
        let mut set = MeasureSet::new(&breakdowns);
        let records: Vec<_> = (0..20).map(|_| record(1, Some("F"), "A")).collect();
        set.add_period(date(1), &records);

        let tables = set.finalize(DEFAULT_REDACTION_THRESHOLD);
        let names: Vec<_> = tables.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["total", "sex"]);

        let (_, sex) = &tables[1];
        assert_eq!(sex.len(), 1);
        assert_eq!(sex[0].event_measure, 20);
    }

    #[test]
    fn test_measure_set_practice_unredacted() {
        let breakdowns = vec!["sex".to_string(), "practice".to_string()];
        let mut set = MeasureSet::new(&breakdowns);
        let records: Vec<_> = (0..3).map(|_| record(1, Some("M"), "A")).collect();
        set.add_period(date(2), &records);
        set.add_period(date(1), &records);

        let tables = set.finalize(DEFAULT_REDACTION_THRESHOLD);
        let names: Vec<_> = tables.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["total", "sex", "practice"]);

        let (_, total) = &tables[0];
        assert_eq!(total[0].period, date(1));
        assert!(total.iter().all(|r| r.value.is_redacted() && r.event_measure == 0));

        let (_, practice) = &tables[2];
        assert_eq!(practice[0].event_measure, 3);
        assert_eq!(practice[0].value, MeasureValue::Rate(1000.0));
    }
}
