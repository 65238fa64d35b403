//! safe-measures: disclosure-controlled measures from per-patient extracts
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (bad input, config, I/O)
//!   2 - Some categories were redacted in too many periods

mod aggregate;
mod cli;
mod config;
mod error;
mod output;
mod pipeline;
mod privacy;
mod readers;
mod stats;
mod summary;
mod top_codes;
mod types;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Commands};
use config::{Analysis, Frequency};
use error::Error;
use pipeline::RunSettings;
use top_codes::TopCodeSettings;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Result;

const EXIT_FAILING_CATEGORIES: i32 = 2;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn execute(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            input_dir,
            output_dir,
            redaction_threshold,
            max_redacted_fraction,
            no_outer,
        } => {
            let mut analysis = Analysis::load(&config)?;
            info!(
                id = analysis.id().unwrap_or("unnamed"),
                schema = analysis.schema_version(),
                "starting run"
            );

            let disclosure = analysis.disclosure_mut();
            if let Some(threshold) = redaction_threshold {
                disclosure.redaction_threshold = threshold;
            }
            if let Some(fraction) = max_redacted_fraction {
                disclosure.max_redacted_fraction = fraction;
            }
            disclosure.validate()?;

            let codelist_dir = config.parent().unwrap_or_else(|| Path::new("."));
            let mut settings = RunSettings::from_analysis(&analysis, codelist_dir);
            settings.outer_percentiles = !no_outer;

            let report = pipeline::run(&input_dir, &output_dir, &settings)?;
            eprintln!(
                "Wrote {} outputs to {}",
                report.manifest.outputs.len(),
                output_dir.display()
            );
            for check in report.failing_checks() {
                eprintln!(
                    "  {}={} redacted in {} of {} periods",
                    check.group, check.group_value, check.redacted, check.total
                );
            }
            Ok(exit_code(report.manifest.failing_categories))
        }
        Commands::Measures {
            input_dir,
            output_dir,
            breakdowns,
            weekly,
        } => {
            let frequency = if weekly {
                Frequency::Weekly
            } else {
                Frequency::Monthly
            };
            let settings = RunSettings::measures_only(breakdowns, frequency);
            let report = pipeline::run(&input_dir, &output_dir, &settings)?;
            Ok(exit_code(report.manifest.failing_categories))
        }
        Commands::TopCodes {
            extract,
            codelist,
            out_dir,
            code_column,
            term_column,
            low_count_threshold,
            rounding_base,
            top_n,
            n,
        } => {
            if rounding_base == 0 {
                return Err(Error::Config("rounding base must be positive".to_string()));
            }
            let settings = TopCodeSettings {
                low_count_threshold,
                rounding_base,
                top_n,
            };
            let tables = pipeline::top_codes_from_files(
                &extract,
                &codelist,
                (&code_column, &term_column),
                &settings,
                &out_dir,
                n,
            )?;
            if tables.top.is_empty() {
                warn!("no codes survived disclosure control; wrote header-only tables");
            }
            Ok(0)
        }
        Commands::Deciles {
            input,
            out,
            no_outer,
        } => {
            let written = pipeline::deciles_from_file(&input, &out, !no_outer)?;
            info!(rows = written, file = %out.display(), "wrote percentiles");
            Ok(0)
        }
        Commands::CheckRedaction {
            input,
            max_fraction,
            passing_out,
        } => {
            if !(0.0..=1.0).contains(&max_fraction) {
                return Err(Error::Config(
                    "max fraction must be between 0 and 1".to_string(),
                ));
            }
            let checks =
                pipeline::check_redaction_file(&input, max_fraction, passing_out.as_deref())?;
            output::write_json_stdout(&checks)?;
            Ok(exit_code(checks.iter().filter(|c| !c.passes).count()))
        }
        Commands::InitConfig { out } => {
            if out.exists() {
                return Err(Error::Config(format!(
                    "{} already exists; remove it first or edit it",
                    out.display()
                )));
            }
            std::fs::write(&out, Analysis::default_toml()?)?;
            eprintln!("Created {}", out.display());
            Ok(0)
        }
    }
}

fn exit_code(failing_categories: usize) -> i32 {
    if failing_categories > 0 {
        warn!(failing_categories, "categories failed the redaction check");
        EXIT_FAILING_CATEGORIES
    } else {
        0
    }
}
