use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::top_codes::{Proportion, TopCodeRow};
use crate::types::{MeasureRow, PercentileRow, Result};

const MEASURE_HEADERS: &[&str] = &[
    "date",
    "event_measure",
    "population",
    "group",
    "group_value",
    "value",
];

const PERCENTILE_HEADERS: &[&str] = &["date", "percentile", "value"];

#[derive(Serialize)]
struct PublishedTopCode<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    #[serde(rename = "Description")]
    description: &'a str,
    #[serde(rename = "Proportion of codes (%)")]
    proportion: Proportion,
}

#[derive(Serialize)]
struct CheckedTopCode<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    num: u64,
    #[serde(rename = "Description")]
    description: &'a str,
    #[serde(rename = "Proportion of codes (%)")]
    proportion: Proportion,
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write serializable rows as CSV with a header line
pub fn write_csv<T: Serialize>(rows: &[T], path: &Path) -> Result<()> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a header-only CSV, for tables that came out empty
fn write_header(headers: &[&str], path: &Path) -> Result<()> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(headers)?;
    writer.flush()?;
    Ok(())
}

/// Write a measure table; an empty table still gets its header line
pub fn write_measure_rows(rows: &[MeasureRow], path: &Path) -> Result<()> {
    if rows.is_empty() {
        return write_header(MEASURE_HEADERS, path);
    }
    write_csv(rows, path)
}

/// Write a percentile table; an empty table still gets its header line
pub fn write_percentile_rows(rows: &[PercentileRow], path: &Path) -> Result<()> {
    if rows.is_empty() {
        return write_header(PERCENTILE_HEADERS, path);
    }
    write_csv(rows, path)
}

/// Write the publishable top-code table
pub fn write_top_codes(rows: &[TopCodeRow], path: &Path) -> Result<()> {
    if rows.is_empty() {
        return write_header(&["Code", "Description", "Proportion of codes (%)"], path);
    }
    let records: Vec<_> = rows
        .iter()
        .map(|r| PublishedTopCode {
            code: &r.code,
            description: &r.description,
            proportion: r.proportion,
        })
        .collect();
    write_csv(&records, path)
}

/// Write the full top-code table including counts, for output checking
pub fn write_top_codes_with_counts(rows: &[TopCodeRow], path: &Path) -> Result<()> {
    if rows.is_empty() {
        return write_header(&["Code", "num", "Description", "Proportion of codes (%)"], path);
    }
    let records: Vec<_> = rows
        .iter()
        .map(|r| CheckedTopCode {
            code: &r.code,
            num: r.num,
            description: &r.description,
            proportion: r.proportion,
        })
        .collect();
    write_csv(&records, path)
}

/// Write a value to a pretty JSON file
pub fn write_json_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    create_parent(path)?;
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

/// Write a value to a pretty JSON string
pub fn to_json_string<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Write a value as JSON to stdout
pub fn write_json_stdout<T: Serialize>(value: &T) -> Result<()> {
    let json = to_json_string(value)?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", json)?;
    Ok(())
}
