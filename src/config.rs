//! Analysis definitions.
//!
//! An analysis is described in a TOML file whose `schema` key names the
//! version of the definition. Each version maps to its own validated struct
//! through [`SCHEMA_REGISTRY`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::top_codes::TopCodeSettings;
use crate::types::{
    Result, DEFAULT_LOW_COUNT_THRESHOLD, DEFAULT_MAX_REDACTED_FRACTION,
    DEFAULT_REDACTION_THRESHOLD, DEFAULT_TOP_CODE_ROUNDING_BASE, DEFAULT_TOP_N, PRACTICE_GROUP,
};

/// Loader turning the body of a definition into a validated analysis
pub type SchemaLoader = fn(toml::Table) -> Result<Analysis>;

/// Known definition versions
pub const SCHEMA_REGISTRY: &[(&str, SchemaLoader)] = &[("v2", load_v2)];

/// Find the loader for a schema version
pub fn lookup_schema(version: &str) -> Option<SchemaLoader> {
    SCHEMA_REGISTRY
        .iter()
        .find(|(name, _)| *name == version)
        .map(|(_, loader)| *loader)
}

/// A validated analysis definition
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    V2(AnalysisV2),
}

impl Analysis {
    /// Load and validate a definition file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let analysis = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), schema = analysis.schema_version(), "loaded analysis");
        Ok(analysis)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(content)?;

        let version = match table.remove("schema") {
            Some(toml::Value::String(v)) => v,
            Some(_) => return Err(Error::Config("'schema' must be a string".to_string())),
            None => return Err(Error::Config("missing 'schema' key".to_string())),
        };

        let loader = lookup_schema(&version)
            .ok_or_else(|| Error::Config(format!("unknown schema version '{}'", version)))?;
        loader(table)
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Analysis::V2(a) => a.id.as_deref(),
        }
    }

    pub fn schema_version(&self) -> &'static str {
        match self {
            Analysis::V2(_) => "v2",
        }
    }

    /// Breakdown columns to aggregate by; practice is always included
    pub fn breakdowns(&self) -> Vec<String> {
        match self {
            Analysis::V2(a) => {
                let mut breakdowns = a.demographics.clone();
                if !breakdowns.iter().any(|b| b == PRACTICE_GROUP) {
                    breakdowns.push(PRACTICE_GROUP.to_string());
                }
                breakdowns
            }
        }
    }

    pub fn codelists(&self) -> Vec<&Codelist> {
        match self {
            Analysis::V2(a) => std::iter::once(&a.codelist_1)
                .chain(a.codelist_2.as_ref())
                .collect(),
        }
    }

    pub fn filters(&self) -> &BTreeMap<String, Vec<String>> {
        match self {
            Analysis::V2(a) => &a.filters,
        }
    }

    /// First and last period to report on; either end may be open
    pub fn period_range(&self) -> (Option<NaiveDate>, Option<NaiveDate>) {
        match self {
            Analysis::V2(a) => (a.start_date, a.end_date),
        }
    }

    pub fn frequency(&self) -> Frequency {
        match self {
            Analysis::V2(a) => a.frequency,
        }
    }

    pub fn disclosure(&self) -> &DisclosureConfig {
        match self {
            Analysis::V2(a) => &a.disclosure,
        }
    }

    pub fn disclosure_mut(&mut self) -> &mut DisclosureConfig {
        match self {
            Analysis::V2(a) => &mut a.disclosure,
        }
    }

    /// Commented default definition, written by `init-config`
    pub fn default_toml() -> Result<String> {
        let body = toml::to_string_pretty(&AnalysisV2::example())?;
        Ok(format!(
            "# safe-measures analysis definition\n\
             # Thresholds under [disclosure] control what may leave the secure environment.\n\n\
             schema = \"v2\"\n\n{}",
            body
        ))
    }
}

/// How often extracts are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Monthly,
    Weekly,
}

/// Kind of record a codelist matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodelistKind {
    Event,
    Medication,
}

/// A codelist used by the analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codelist {
    pub label: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub kind: CodelistKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Where the codelist CSV was downloaded to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_code_column")]
    pub code_column: String,
    #[serde(default = "default_term_column")]
    pub term_column: String,
}

fn default_code_column() -> String {
    "code".to_string()
}

fn default_term_column() -> String {
    "term".to_string()
}

/// Disclosure-control thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisclosureConfig {
    /// Measure counts below this are redacted
    #[serde(default = "default_redaction_threshold")]
    pub redaction_threshold: u64,

    /// Code counts at or below this are grouped into "Other"
    #[serde(default = "default_low_count_threshold")]
    pub low_count_threshold: u64,

    /// Top-code counts are rounded to a multiple of this
    #[serde(default = "default_top_code_rounding_base")]
    pub top_code_rounding_base: u64,

    /// Categories redacted more often than this are flagged
    #[serde(default = "default_max_redacted_fraction")]
    pub max_redacted_fraction: f64,

    /// Rows in a published top-code table
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for DisclosureConfig {
    fn default() -> Self {
        Self {
            redaction_threshold: default_redaction_threshold(),
            low_count_threshold: default_low_count_threshold(),
            top_code_rounding_base: default_top_code_rounding_base(),
            max_redacted_fraction: default_max_redacted_fraction(),
            top_n: default_top_n(),
        }
    }
}

impl DisclosureConfig {
    pub fn top_code_settings(&self) -> TopCodeSettings {
        TopCodeSettings {
            low_count_threshold: self.low_count_threshold,
            rounding_base: self.top_code_rounding_base,
            top_n: self.top_n,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.redaction_threshold == 0 {
            return Err(Error::Config("redaction_threshold must be positive".to_string()));
        }
        if self.top_code_rounding_base == 0 {
            return Err(Error::Config("top_code_rounding_base must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.max_redacted_fraction) {
            return Err(Error::Config(
                "max_redacted_fraction must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_redaction_threshold() -> u64 {
    DEFAULT_REDACTION_THRESHOLD
}

fn default_low_count_threshold() -> u64 {
    DEFAULT_LOW_COUNT_THRESHOLD
}

fn default_top_code_rounding_base() -> u64 {
    DEFAULT_TOP_CODE_ROUNDING_BASE
}

fn default_max_redacted_fraction() -> f64 {
    DEFAULT_MAX_REDACTED_FRACTION
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

/// Filters restricting the study population to adults with a recorded sex
pub fn default_filters() -> BTreeMap<String, Vec<String>> {
    let age_bands = ["18-19", "20-29", "30-39", "40-49", "50-59", "60-69", "70-79", "80+"];
    BTreeMap::from([
        ("sex".to_string(), vec!["M".to_string(), "F".to_string()]),
        (
            "age_band".to_string(),
            age_bands.iter().map(|b| b.to_string()).collect(),
        ),
    ])
}

/// Version 2 analysis definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisV2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub created_by: String,
    pub codelist_1: Codelist,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codelist_2: Option<Codelist>,
    #[serde(default)]
    pub demographics: Vec<String>,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_filters")]
    pub filters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub disclosure: DisclosureConfig,
}

impl AnalysisV2 {
    fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for d in &self.demographics {
            if d.trim().is_empty() {
                return Err(Error::Config("empty demographic name".to_string()));
            }
            if seen.contains(&d) {
                return Err(Error::Config(format!("demographic '{}' listed twice", d)));
            }
            seen.push(d);
        }

        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(Error::Config(format!(
                    "start_date {} is after end_date {}",
                    start, end
                )));
            }
        }

        self.disclosure.validate()
    }

    fn example() -> Self {
        Self {
            id: None,
            created_by: "analyst".to_string(),
            codelist_1: Codelist {
                label: "DMARDs".to_string(),
                slug: "opensafely/dmards/2020-06-23".to_string(),
                kind: CodelistKind::Medication,
                description: None,
                path: Some(PathBuf::from("codelists/codelist_1.csv")),
                code_column: default_code_column(),
                term_column: default_term_column(),
            },
            codelist_2: None,
            demographics: ["age_band", "sex", "imd", "region", "ethnicity"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            frequency: Frequency::Monthly,
            start_date: None,
            end_date: None,
            filters: default_filters(),
            disclosure: DisclosureConfig::default(),
        }
    }
}

fn load_v2(table: toml::Table) -> Result<Analysis> {
    let analysis: AnalysisV2 = toml::Value::Table(table).try_into()?;
    analysis.validate()?;
    Ok(Analysis::V2(analysis))
}
