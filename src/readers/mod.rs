pub mod csv;

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::Error;
use crate::types::Result;

pub use self::csv::CsvReader;

// Extract files are named input_YYYY-MM-DD.csv by the study definition
static INPUT_FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^input_20\d\d-(0[1-9]|1[012])-(0[1-9]|[12][0-9]|3[01])\.csv$")
        .expect("input file pattern is valid")
});

static INPUT_FILE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^input_(.*)\.csv$").expect("input date pattern is valid"));

/// Whether a file name looks like a period extract
pub fn match_input_file(file_name: &str) -> bool {
    INPUT_FILE_PATTERN.is_match(file_name)
}

/// Period encoded in an extract file name.
///
/// A name that does not follow the extract pattern, or whose date does not
/// exist on the calendar (such as 2023-02-30), is an error.
pub fn date_from_input_file(file_name: &str) -> Result<NaiveDate> {
    if !match_input_file(file_name) {
        return Err(Error::InputFileName(file_name.to_string()));
    }

    let date = INPUT_FILE_DATE
        .captures(file_name)
        .and_then(|c| c.get(1))
        .ok_or_else(|| Error::InputFileName(file_name.to_string()))?;

    NaiveDate::parse_from_str(date.as_str(), "%Y-%m-%d")
        .map_err(|_| Error::InputFileName(file_name.to_string()))
}

/// Extract files in `dir`, ordered by period.
///
/// Files that are not extracts are skipped; an extract whose date cannot be
/// read aborts the search.
pub fn find_extract_files(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !match_input_file(name) {
            debug!(file = %name, "skipping non-extract file");
            continue;
        }

        found.push((date_from_input_file(name)?, path));
    }

    found.sort();
    Ok(found)
}
