use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::{
    DEFAULT_LOW_COUNT_THRESHOLD, DEFAULT_MAX_REDACTED_FRACTION, DEFAULT_TOP_CODE_ROUNDING_BASE,
    DEFAULT_TOP_N,
};

/// Disclosure-controlled measures from per-patient extracts
#[derive(Parser, Debug)]
#[command(name = "safe-measures")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every output described by an analysis file
    Run {
        /// Analysis TOML file
        #[arg(short, long)]
        config: PathBuf,

        /// Directory holding input_YYYY-MM-DD.csv extracts
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Directory for published and for_checking outputs
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Override the measure redaction threshold
        #[arg(long)]
        redaction_threshold: Option<u64>,

        /// Override the maximum redacted fraction per category
        #[arg(long)]
        max_redacted_fraction: Option<f64>,

        /// Skip the 1st-9th and 91st-99th percentiles
        #[arg(long, default_value_t = false)]
        no_outer: bool,
    },

    /// Build measure tables without an analysis file
    Measures {
        /// Directory holding input_YYYY-MM-DD.csv extracts
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Directory for outputs
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Comma-separated breakdown columns
        #[arg(short, long, value_delimiter = ',')]
        breakdowns: Vec<String>,

        /// Treat extracts as weekly (total measure only)
        #[arg(long, default_value_t = false)]
        weekly: bool,
    },

    /// Build a top-code table from one extract and one codelist
    TopCodes {
        /// Extract with count_<code> columns
        #[arg(short, long)]
        extract: PathBuf,

        /// Codelist CSV
        #[arg(short, long)]
        codelist: PathBuf,

        /// Output directory
        #[arg(short, long)]
        out_dir: PathBuf,

        /// Codelist column holding codes
        #[arg(long, default_value = "code")]
        code_column: String,

        /// Codelist column holding descriptions
        #[arg(long, default_value = "term")]
        term_column: String,

        /// Counts at or below this are grouped into "Other"
        #[arg(long, default_value_t = DEFAULT_LOW_COUNT_THRESHOLD)]
        low_count_threshold: u64,

        /// Round counts to a multiple of this
        #[arg(long, default_value_t = DEFAULT_TOP_CODE_ROUNDING_BASE)]
        rounding_base: u64,

        /// Rows in the published table
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top_n: usize,

        /// Number used in the output file names
        #[arg(short, long, default_value_t = 1)]
        n: usize,
    },

    /// Percentiles of a measure table
    Deciles {
        /// Measure CSV written by a previous run
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV
        #[arg(short, long)]
        out: PathBuf,

        /// Skip the 1st-9th and 91st-99th percentiles
        #[arg(long, default_value_t = false)]
        no_outer: bool,
    },

    /// Report categories redacted in too many periods
    CheckRedaction {
        /// Measure CSV written by a previous run
        #[arg(short, long)]
        input: PathBuf,

        /// Largest acceptable fraction of redacted periods
        #[arg(long, default_value_t = DEFAULT_MAX_REDACTED_FRACTION)]
        max_fraction: f64,

        /// Write the rows of passing categories to this CSV
        #[arg(long)]
        passing_out: Option<PathBuf>,
    },

    /// Write an example analysis file
    InitConfig {
        /// Output TOML file
        #[arg(short, long, default_value = "analysis.toml")]
        out: PathBuf,
    },
}
