use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::aggregate::{filter_records, MeasureSet};
use crate::config::{default_filters, Analysis, Codelist, DisclosureConfig, Frequency};
use crate::error::Error;
use crate::output;
use crate::privacy::{drop_redacted_groups, validate_redaction_rate, RedactionCheck};
use crate::readers::{find_extract_files, CsvReader};
use crate::stats::compute_percentiles;
use crate::summary::{EventSummary, EventTally};
use crate::top_codes::{
    counts_for_codelist, create_top_code_table, sum_code_counts, TopCodeSettings, TopCodeTables,
};
use crate::types::{MeasureRow, Result, PRACTICE_GROUP, TOTAL_GROUP};

/// Everything a reporting run needs to know
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub breakdowns: Vec<String>,
    pub filters: BTreeMap<String, Vec<String>>,
    pub frequency: Frequency,
    pub disclosure: DisclosureConfig,
    pub codelists: Vec<Codelist>,
    /// Relative codelist paths are resolved against this directory
    pub codelist_dir: PathBuf,
    pub outer_percentiles: bool,
    /// Extracts dated outside this range are not read
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl RunSettings {
    pub fn from_analysis(analysis: &Analysis, codelist_dir: &Path) -> Self {
        let (start_date, end_date) = analysis.period_range();
        Self {
            breakdowns: analysis.breakdowns(),
            filters: analysis.filters().clone(),
            frequency: analysis.frequency(),
            disclosure: analysis.disclosure().clone(),
            codelists: analysis.codelists().into_iter().cloned().collect(),
            codelist_dir: codelist_dir.to_path_buf(),
            outer_percentiles: true,
            start_date,
            end_date,
        }
    }

    /// Measures only, for the given breakdowns and the default filters
    pub fn measures_only(breakdowns: Vec<String>, frequency: Frequency) -> Self {
        Self {
            breakdowns,
            filters: default_filters(),
            frequency,
            disclosure: DisclosureConfig::default(),
            codelists: Vec::new(),
            codelist_dir: PathBuf::from("."),
            outer_percentiles: true,
            start_date: None,
            end_date: None,
        }
    }

    fn in_range(&self, period: NaiveDate) -> bool {
        self.start_date.map_or(true, |start| period >= start)
            && self.end_date.map_or(true, |end| period <= end)
    }

    fn check_breakdowns(&self) -> Result<()> {
        for (idx, breakdown) in self.breakdowns.iter().enumerate() {
            if self.breakdowns[..idx].contains(breakdown) {
                return Err(Error::Config(format!(
                    "breakdown '{}' listed twice",
                    breakdown
                )));
            }
        }
        Ok(())
    }
}

/// An extract consumed by a run
#[derive(Debug, Clone, Serialize)]
pub struct InputFile {
    pub file_name: String,
    pub period: NaiveDate,
    pub sha256: String,
}

/// Provenance of a run, written next to its outputs
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub version: String,
    pub generated_at: String,
    pub frequency: Frequency,
    pub disclosure: DisclosureConfig,
    pub inputs: Vec<InputFile>,
    pub outputs: Vec<String>,
    pub failing_categories: usize,
}

/// Outcome of a reporting run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub manifest: RunManifest,
    pub redaction_checks: Vec<RedactionCheck>,
    pub summary: EventSummary,
}

impl RunReport {
    pub fn failing_checks(&self) -> impl Iterator<Item = &RedactionCheck> {
        self.redaction_checks.iter().filter(|c| !c.passes)
    }
}

/// Run the full pipeline over the extracts in `input_dir`
pub fn run(input_dir: &Path, output_dir: &Path, settings: &RunSettings) -> Result<RunReport> {
    settings.check_breakdowns()?;

    let mut files = find_extract_files(input_dir)?;
    let found = files.len();
    files.retain(|(period, _)| settings.in_range(*period));
    if files.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no input_YYYY-MM-DD.csv extracts in {} for the requested periods",
            input_dir.display()
        )));
    }
    info!(
        extracts = files.len(),
        skipped = found - files.len(),
        dir = %input_dir.display(),
        "found extracts"
    );

    let breakdowns = match settings.frequency {
        Frequency::Monthly => settings.breakdowns.clone(),
        Frequency::Weekly => Vec::new(),
    };
    let mut measures = MeasureSet::new(&breakdowns);
    let mut tally = EventTally::new();
    let mut code_totals = BTreeMap::new();
    let mut inputs = Vec::with_capacity(files.len());

    for (period, path) in &files {
        let extract = CsvReader::for_path(path).read_extract(*period)?;
        if let Some(missing) = breakdowns.iter().find(|b| !extract.columns.contains(*b)) {
            return Err(Error::InvalidInput(format!(
                "{}: breakdown column '{}' not found",
                path.display(),
                missing
            )));
        }
        let before = extract.records.len();
        let records = filter_records(extract.records, &settings.filters, &extract.columns);
        info!(period = %extract.period, rows = before, kept = records.len(), "read extract");

        measures.add_period(extract.period, &records);
        tally.add(&records);
        sum_code_counts(&records, &mut code_totals);

        inputs.push(InputFile {
            file_name: file_name(path),
            period: *period,
            sha256: compute_file_hash(path)?,
        });
    }

    let threshold = settings.disclosure.redaction_threshold;
    let mut outputs = Vec::new();
    let mut published: Vec<MeasureRow> = Vec::new();

    for (name, rows) in measures.finalize(threshold) {
        match settings.frequency {
            Frequency::Weekly => {
                write_output(&mut outputs, output_dir, "measure_all_weekly.csv", |p| {
                    output::write_measure_rows(&rows, p)
                })?;
            }
            Frequency::Monthly if name == PRACTICE_GROUP => {
                // exact practice rates are for checking only; deciles are published
                let checking = "for_checking/measure_practice_rate.csv";
                write_output(&mut outputs, output_dir, checking, |p| {
                    output::write_measure_rows(&rows, p)
                })?;

                let deciles = compute_percentiles(&rows, settings.outer_percentiles);
                let published_deciles = "measure_practice_rate_deciles.csv";
                write_output(&mut outputs, output_dir, published_deciles, |p| {
                    output::write_percentile_rows(&deciles, p)
                })?;
            }
            Frequency::Monthly => {
                let file = format!("measure_{}_rate.csv", name);
                write_output(&mut outputs, output_dir, &file, |p| {
                    output::write_measure_rows(&rows, p)
                })?;
            }
        }

        if name != PRACTICE_GROUP {
            published.extend(rows);
        }
    }

    if settings.frequency == Frequency::Monthly {
        write_output(&mut outputs, output_dir, "measure_all.csv", |p| {
            output::write_measure_rows(&published, p)
        })?;
    }

    let checks: Vec<RedactionCheck> =
        validate_redaction_rate(&published, settings.disclosure.max_redacted_fraction)
            .into_iter()
            .filter(|c| c.group != TOTAL_GROUP)
            .collect();
    for check in checks.iter().filter(|c| !c.passes) {
        warn!(
            group = %check.group,
            group_value = %check.group_value,
            fraction = check.fraction,
            "category redacted in too many periods"
        );
    }
    write_output(&mut outputs, output_dir, "redaction_check.json", |p| {
        output::write_json_file(&checks, p)
    })?;

    let summary = tally.finish(threshold);
    write_output(&mut outputs, output_dir, "event_counts.json", |p| {
        output::write_json_file(&summary, p)
    })?;

    for (idx, codelist) in settings.codelists.iter().enumerate() {
        let Some(path) = &codelist.path else {
            warn!(codelist = %codelist.slug, "codelist has no local path; top codes skipped");
            continue;
        };
        let path = settings.codelist_dir.join(path);
        let entries = CsvReader::for_path(&path)
            .read_codelist(&codelist.code_column, &codelist.term_column)?;
        let counts = counts_for_codelist(&code_totals, &entries);
        let tables =
            create_top_code_table(&counts, &entries, &settings.disclosure.top_code_settings());
        info!(
            codelist = %codelist.slug,
            codes = counts.len(),
            published = tables.top.len(),
            "built top codes"
        );

        let n = idx + 1;
        write_output(&mut outputs, output_dir, &format!("top_5_code_table_{}.csv", n), |p| {
            output::write_top_codes(&tables.top, p)
        })?;
        write_output(
            &mut outputs,
            output_dir,
            &format!("for_checking/top_5_code_table_with_counts_{}.csv", n),
            |p| output::write_top_codes_with_counts(&tables.with_counts, p),
        )?;
    }

    let failing_categories = checks.iter().filter(|c| !c.passes).count();
    let manifest = RunManifest {
        version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        frequency: settings.frequency,
        disclosure: settings.disclosure.clone(),
        inputs,
        outputs: outputs.clone(),
        failing_categories,
    };
    output::write_json_file(&manifest, &output_dir.join("run_manifest.json"))?;

    Ok(RunReport {
        manifest,
        redaction_checks: checks,
        summary,
    })
}

/// Top-code tables for one extract and one codelist, written as
/// `top_5_code_table_<n>.csv` plus the checking copy with counts
pub fn top_codes_from_files(
    extract_path: &Path,
    codelist_path: &Path,
    columns: (&str, &str),
    settings: &TopCodeSettings,
    output_dir: &Path,
    n: usize,
) -> Result<TopCodeTables> {
    let (_, records) = CsvReader::for_path(extract_path).read_records()?;
    let mut totals = BTreeMap::new();
    sum_code_counts(&records, &mut totals);

    let (code_column, term_column) = columns;
    let entries = CsvReader::for_path(codelist_path).read_codelist(code_column, term_column)?;
    let counts = counts_for_codelist(&totals, &entries);
    let tables = create_top_code_table(&counts, &entries, settings);
    info!(codes = counts.len(), published = tables.top.len(), "built top codes");

    let top = output_dir.join(format!("top_5_code_table_{}.csv", n));
    output::write_top_codes(&tables.top, &top)?;
    let checking = format!("for_checking/top_5_code_table_with_counts_{}.csv", n);
    output::write_top_codes_with_counts(&tables.with_counts, &output_dir.join(checking))?;
    Ok(tables)
}

/// Percentiles of a measure table previously written by a run
pub fn deciles_from_file(measure_path: &Path, out_path: &Path, outer: bool) -> Result<usize> {
    let rows = CsvReader::for_path(measure_path).read_measure_rows()?;
    let percentiles = compute_percentiles(&rows, outer);
    output::write_percentile_rows(&percentiles, out_path)?;
    Ok(percentiles.len())
}

/// Redaction gate over a measure table previously written by a run.
///
/// With `passing_out`, the rows of categories that pass are written there.
pub fn check_redaction_file(
    measure_path: &Path,
    max_fraction: f64,
    passing_out: Option<&Path>,
) -> Result<Vec<RedactionCheck>> {
    let rows = CsvReader::for_path(measure_path).read_measure_rows()?;
    if let Some(path) = passing_out {
        let kept = drop_redacted_groups(&rows, max_fraction);
        info!(rows = rows.len(), kept = kept.len(), "dropped failing categories");
        output::write_measure_rows(&kept, path)?;
    }
    Ok(validate_redaction_rate(&rows, max_fraction))
}

fn write_output(
    outputs: &mut Vec<String>,
    output_dir: &Path,
    relative: &str,
    write: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    let path = output_dir.join(relative);
    write(&path)?;
    info!(file = %path.display(), "wrote output");
    outputs.push(relative.to_string());
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Compute SHA-256 hash of a file (streaming to handle large files)
fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodelistKind;
    use crate::types::MeasureValue;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    /// 30 patients per period across two practices, 12 female with events
    fn write_extract(dir: &Path, date: &str) {
        let mut content = String::from("patient_id,event_measure,sex,age_band,practice,count_A,count_B\n");
        for i in 0..30 {
            let sex = if i < 20 { "F" } else { "M" };
            let event = if i < 12 { 1 } else { 0 };
            let practice = if i % 2 == 0 { "P1" } else { "P2" };
            content.push_str(&format!("{},{},{},30-39,{},{},{}\n", i, event, sex, practice, event * 3, event));
        }
        // filtered out by the default sex filter
        content.push_str("99,1,U,30-39,P1,5,5\n");
        std::fs::write(dir.join(format!("input_{}.csv", date)), content).unwrap();
    }

    fn settings(codelist_dir: &Path, codelists: Vec<Codelist>) -> RunSettings {
        RunSettings {
            codelists,
            codelist_dir: codelist_dir.to_path_buf(),
            ..RunSettings::measures_only(vec!["sex".to_string(), "practice".to_string()], Frequency::Monthly)
        }
    }

    #[test]
    fn test_compute_file_hash() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "test content").unwrap();

        let hash = compute_file_hash(file.path()).unwrap();
        assert_eq!(hash.len(), 64); // SHA-256 produces 64 hex chars
    }

    #[test]
    fn test_full_run() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_extract(input.path(), "2022-01-01");
        write_extract(input.path(), "2022-02-01");
        std::fs::write(input.path().join("codelist_1.csv"), "code,term\nA,Asthma\nB,Bronchitis\n").unwrap();

        let codelist = Codelist {
            label: "Respiratory".to_string(),
            slug: "test/respiratory".to_string(),
            kind: CodelistKind::Event,
            description: None,
            path: Some(PathBuf::from("codelist_1.csv")),
            code_column: "code".to_string(),
            term_column: "term".to_string(),
        };

        let report = run(input.path(), out.path(), &settings(input.path(), vec![codelist])).unwrap();

        assert_eq!(report.manifest.inputs.len(), 2);
        assert_eq!(report.manifest.inputs[0].file_name, "input_2022-01-01.csv");

        let total = CsvReader::new(&out.path().join("measure_total_rate.csv"))
            .read_measure_rows()
            .unwrap();
        assert_eq!(total.len(), 2);
        assert_eq!(total[0].event_measure, 10);
        assert_eq!(total[0].population, 30);

        let sex = CsvReader::new(&out.path().join("measure_sex_rate.csv"))
            .read_measure_rows()
            .unwrap();
        // M has no events in any period
        assert!(sex.iter().filter(|r| r.group_value == "M").all(|r| r.value == MeasureValue::Redacted));
        assert!(report.failing_checks().any(|c| c.group_value == "M"));

        let all = CsvReader::new(&out.path().join("measure_all.csv"))
            .read_measure_rows()
            .unwrap();
        assert!(all.iter().all(|r| r.group != PRACTICE_GROUP));
        assert_eq!(all.len(), 2 + 4);

        assert!(out.path().join("measure_practice_rate_deciles.csv").exists());
        assert!(out.path().join("for_checking/measure_practice_rate.csv").exists());

        let top = std::fs::read_to_string(out.path().join("top_5_code_table_1.csv")).unwrap();
        assert_eq!(top, "Code,Description,Proportion of codes (%)\nA,Asthma,76.92\nB,Bronchitis,23.08\n");

        // 24 events over 2 periods, 30 patients
        assert_eq!(report.summary.total_events, 20);
        assert_eq!(report.summary.unique_patients, 30);
        assert!(out.path().join("run_manifest.json").exists());
    }

    #[test]
    fn test_weekly_run_writes_total_only() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_extract(input.path(), "2022-01-03");

        let mut settings = settings(input.path(), Vec::new());
        settings.frequency = Frequency::Weekly;
        let report = run(input.path(), out.path(), &settings).unwrap();

        assert!(out.path().join("measure_all_weekly.csv").exists());
        assert!(!out.path().join("measure_sex_rate.csv").exists());
        assert!(report.redaction_checks.is_empty());
    }

    #[test]
    fn test_missing_breakdown_column_is_error() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_extract(input.path(), "2022-01-01");

        let settings = RunSettings::measures_only(vec!["region".to_string()], Frequency::Monthly);
        let result = run(input.path(), out.path(), &settings);

        assert!(matches!(result, Err(Error::InvalidInput(ref msg)) if msg.contains("region")));
        assert!(!out.path().join("measure_region_rate.csv").exists());
    }

    #[test]
    fn test_duplicate_breakdown_is_error() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_extract(input.path(), "2022-01-01");

        let settings =
            RunSettings::measures_only(vec!["sex".to_string(), "sex".to_string()], Frequency::Monthly);
        let result = run(input.path(), out.path(), &settings);

        assert!(matches!(result, Err(Error::Config(_))));
        assert!(!out.path().join("measure_all.csv").exists());
    }

    #[test]
    fn test_extracts_outside_period_range_skipped() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        for date in ["2022-01-01", "2022-02-01", "2022-03-01"] {
            write_extract(input.path(), date);
        }

        let mut settings = settings(input.path(), Vec::new());
        settings.start_date = NaiveDate::from_ymd_opt(2022, 2, 1);
        settings.end_date = NaiveDate::from_ymd_opt(2022, 2, 28);
        let report = run(input.path(), out.path(), &settings).unwrap();

        assert_eq!(report.manifest.inputs.len(), 1);
        assert_eq!(report.manifest.inputs[0].file_name, "input_2022-02-01.csv");

        settings.start_date = NaiveDate::from_ymd_opt(2023, 1, 1);
        settings.end_date = None;
        assert!(matches!(
            run(input.path(), out.path(), &settings),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_empty_input_dir_is_error() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let result = run(input.path(), out.path(), &settings(input.path(), Vec::new()));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_top_codes_from_files() {
        let dir = TempDir::new().unwrap();
        let extract = dir.path().join("extract.csv");
        std::fs::write(&extract, "event_measure,count_A,count_B,count_C\n1,20,3,9\n1,10,5,0\n").unwrap();
        let codelist = dir.path().join("codes.csv");
        std::fs::write(&codelist, "ctv3,desc\nA,Asthma\nB,Bronchitis\n").unwrap();

        let tables = top_codes_from_files(
            &extract,
            &codelist,
            ("ctv3", "desc"),
            &TopCodeSettings::default(),
            dir.path(),
            2,
        )
        .unwrap();

        // C is not in the codelist
        assert_eq!(tables.with_counts.len(), 2);
        assert_eq!(tables.top[0].code, "A");
        assert_eq!(tables.top[0].num, 28);
        assert_eq!(tables.top[1].num, 7);
        assert!(dir.path().join("top_5_code_table_2.csv").exists());
        assert!(dir.path().join("for_checking/top_5_code_table_with_counts_2.csv").exists());
    }

    #[test]
    fn test_check_redaction_file() {
        let dir = TempDir::new().unwrap();
        let measure = dir.path().join("measure_sex_rate.csv");
        std::fs::write(
            &measure,
            "date,event_measure,population,group,group_value,value\n\
             2022-01-01,0,100,sex,M,[Redacted]\n\
             2022-02-01,0,100,sex,M,[Redacted]\n\
             2022-01-01,20,100,sex,F,200.0\n",
        )
        .unwrap();

        let passing = dir.path().join("passing.csv");
        let checks = check_redaction_file(&measure, 0.5, Some(&passing)).unwrap();
        let male = checks.iter().find(|c| c.group_value == "M").unwrap();
        assert!(!male.passes);
        assert!(checks.iter().find(|c| c.group_value == "F").unwrap().passes);

        let kept = CsvReader::new(&passing).read_measure_rows().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].group_value, "F");
    }

    #[test]
    fn test_deciles_from_file() {
        let dir = TempDir::new().unwrap();
        let measure = dir.path().join("measure_practice_rate.csv");
        std::fs::write(
            &measure,
            "date,event_measure,population,group,group_value,value\n\
             2022-01-01,1,10,practice,P1,100.0\n\
             2022-01-01,3,10,practice,P2,300.0\n",
        )
        .unwrap();

        let out = dir.path().join("deciles.csv");
        let written = deciles_from_file(&measure, &out, false).unwrap();
        assert_eq!(written, 9);
    }
}
