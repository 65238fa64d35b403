use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::{Reader, ReaderBuilder, StringRecord};

use crate::error::Error;
use crate::types::{CodelistEntry, Extract, ExtractRecord, MeasureRow, Result};

/// Missing value tokens
pub const MISSING_TOKENS: &[&str] = &[
    "", "NA", "N/A", "na", "n/a", "NULL", "null", "NaN", "nan", "None", "none", "missing",
    "MISSING",
];

const PATIENT_ID_COLUMN: &str = "patient_id";
const EVENT_COLUMN: &str = "event_measure";
const POPULATION_COLUMN: &str = "population";
const CODE_COUNT_PREFIX: &str = "count_";

/// Check if a cell holds one of the missing value tokens
pub fn is_missing(value: &str) -> bool {
    MISSING_TOKENS.contains(&value.trim())
}

/// CSV/TSV table reader
pub struct CsvReader {
    path: PathBuf,
    delimiter: u8,
}

impl CsvReader {
    /// Create a new CSV reader
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            delimiter: b',',
        }
    }

    /// Create a new TSV reader
    pub fn new_tsv(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            delimiter: b'\t',
        }
    }

    /// Pick the delimiter from the file extension
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab") => {
                Self::new_tsv(path)
            }
            _ => Self::new(path),
        }
    }

    fn create_reader(&self) -> Result<Reader<BufReader<File>>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let csv_reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        Ok(csv_reader)
    }

    /// Read a per-patient extract for `period`.
    ///
    /// `event_measure` is required. Without a `population` column every row
    /// counts once towards the population. `count_<code>` columns become code
    /// counts; all other columns are categories.
    pub fn read_extract(&self, period: NaiveDate) -> Result<Extract> {
        let (columns, records) = self.read_records()?;
        Ok(Extract {
            period,
            columns,
            records,
        })
    }

    /// Header and per-patient records of an extract, without a period
    pub fn read_records(&self) -> Result<(Vec<String>, Vec<ExtractRecord>)> {
        let mut reader = self.create_reader()?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let event_idx = position(&headers, EVENT_COLUMN).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{}: missing '{}' column",
                self.path.display(),
                EVENT_COLUMN
            ))
        })?;
        let population_idx = position(&headers, POPULATION_COLUMN);
        let patient_idx = position(&headers, PATIENT_ID_COLUMN);

        let mut records = Vec::new();
        for (row_idx, result) in reader.records().enumerate() {
            let row = result?;
            let line = row_idx + 2;

            let mut record = ExtractRecord {
                patient_id: field(&row, patient_idx).map(str::to_string),
                event_measure: self.parse_count(field(&row, Some(event_idx)), EVENT_COLUMN, line)?,
                population: match population_idx {
                    Some(idx) => self.parse_count(field(&row, Some(idx)), POPULATION_COLUMN, line)?,
                    None => 1,
                },
                ..Default::default()
            };

            for (col_idx, header) in headers.iter().enumerate() {
                if col_idx == event_idx || Some(col_idx) == population_idx || Some(col_idx) == patient_idx {
                    continue;
                }
                if let Some(code) = header.strip_prefix(CODE_COUNT_PREFIX) {
                    let num = self.parse_count(field(&row, Some(col_idx)), header, line)?;
                    record.code_counts.insert(code.to_string(), num);
                } else if let Some(value) = field(&row, Some(col_idx)) {
                    record.categories.insert(header.clone(), value.to_string());
                }
            }

            records.push(record);
        }

        Ok((headers, records))
    }

    /// Read a codelist, taking codes and terms from the named columns
    pub fn read_codelist(&self, code_column: &str, term_column: &str) -> Result<Vec<CodelistEntry>> {
        let mut reader = self.create_reader()?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let code_idx = position(&headers, code_column).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{}: missing '{}' column",
                self.path.display(),
                code_column
            ))
        })?;
        let term_idx = position(&headers, term_column);

        let mut entries = Vec::new();
        for result in reader.records() {
            let row = result?;
            let Some(code) = field(&row, Some(code_idx)) else {
                continue;
            };
            entries.push(CodelistEntry {
                code: code.to_string(),
                term: field(&row, term_idx).unwrap_or_default().to_string(),
            });
        }

        Ok(entries)
    }

    /// Read a measure table previously written by this tool
    pub fn read_measure_rows(&self) -> Result<Vec<MeasureRow>> {
        let mut reader = self.create_reader()?;
        let mut rows = Vec::new();
        for result in reader.deserialize() {
            rows.push(result?);
        }
        Ok(rows)
    }

    fn parse_count(&self, value: Option<&str>, column: &str, line: usize) -> Result<u64> {
        let Some(raw) = value else {
            return Ok(0);
        };
        parse_count(raw).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} line {}: '{}' in column '{}' is not a count",
                self.path.display(),
                line,
                raw,
                column
            ))
        })
    }
}

fn position(headers: &[String], name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

/// Non-missing trimmed cell
fn field(row: &StringRecord, idx: Option<usize>) -> Option<&str> {
    let value = row.get(idx?)?.trim();
    if is_missing(value) {
        None
    } else {
        Some(value)
    }
}

/// Parse a non-negative whole number, accepting "3" as well as "3.0"
fn parse_count(raw: &str) -> Option<u64> {
    if let Ok(n) = raw.parse::<u64>() {
        return Some(n);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => Some(f as u64),
        _ => None,
    }
}
