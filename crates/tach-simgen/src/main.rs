//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "01-bootstrap"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Dataset generator CLI for scenario authoring."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use tach_common::DatasetScale;
use tach_logging::tach_info;
use tach_sim::{write_csv_dir, write_json, Dataset, DatasetGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Generate synthetic station/program/schedule datasets for Tachyon scenarios",
    long_about = None
)]
struct Cli {
    /// Number of stations to generate
    #[arg(long, default_value_t = 10)]
    stations: u32,

    /// Virtual days of programming per station
    #[arg(long, default_value_t = 7)]
    days: u32,

    /// Number of recording schedules
    #[arg(long, default_value_t = 200)]
    schedules: u32,

    /// Programs aired per station per day
    #[arg(long, default_value_t = 4)]
    programs_per_day: u32,

    /// Random seed for the generator
    #[arg(long)]
    seed: Option<u64>,

    /// Virtual epoch (RFC 3339) that program offsets are relative to
    #[arg(long)]
    epoch: Option<DateTime<Utc>>,

    /// Output path. A file for JSON ('-' for stdout), a directory for CSV.
    #[arg(long, default_value = "dataset.json")]
    output: PathBuf,

    /// Explicit output format when the path is ambiguous
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,
}

fn main() -> Result<()> {
    tach_logging::init();
    let cli = Cli::parse();
    let dataset = generate(&cli)?;
    let fingerprint = dataset.fingerprint().context("failed to fingerprint dataset")?;

    match determine_format(&cli.output, cli.format) {
        OutputFormat::Json => emit_json(&dataset, &cli.output)?,
        OutputFormat::Csv => {
            if cli.output.as_os_str() == "-" {
                return Err(anyhow!("csv output needs a directory, not stdout"));
            }
            write_csv_dir(&dataset, &cli.output)?;
        }
    }

    let counts = dataset.counts();
    tach_info!(
        "generated {} stations, {} programs, {} schedules",
        counts.stations,
        counts.programs,
        counts.schedules
    );
    eprintln!("fingerprint {fingerprint}");
    if cli.output.as_os_str() != "-" {
        eprintln!("wrote dataset -> {}", cli.output.display());
    }
    Ok(())
}

fn generate(cli: &Cli) -> Result<Dataset> {
    let defaults = DatasetScale::default();
    let epoch = cli.epoch.unwrap_or_else(|| tach_common::RunConfig::default().virtual_epoch);
    DatasetGenerator::new(cli.seed.unwrap_or(defaults.seed), epoch)
        .with_programs_per_day(cli.programs_per_day)
        .with_regions(defaults.regions)
        .generate(cli.stations, cli.days, cli.schedules)
        .map_err(anyhow::Error::new)
}

fn determine_format(path: &Path, override_format: Option<OutputFormat>) -> OutputFormat {
    if let Some(format) = override_format {
        return format;
    }
    if path.as_os_str() == "-" {
        return OutputFormat::Json;
    }
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => OutputFormat::Json,
        _ => OutputFormat::Csv,
    }
}

fn emit_json(dataset: &Dataset, output: &Path) -> Result<()> {
    if output.as_os_str() == "-" {
        write_json(dataset, io::stdout().lock())
    } else {
        let file = File::create(output)
            .with_context(|| format!("failed to create output file {}", output.display()))?;
        write_json(dataset, BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            stations: 3,
            days: 2,
            schedules: 15,
            programs_per_day: 4,
            seed: Some(99),
            epoch: None,
            output: PathBuf::from("dataset.json"),
            format: None,
        }
    }

    #[test]
    fn format_follows_extension_and_override() {
        assert_eq!(determine_format(Path::new("out.json"), None), OutputFormat::Json);
        assert_eq!(determine_format(Path::new("out"), None), OutputFormat::Csv);
        assert_eq!(determine_format(Path::new("-"), None), OutputFormat::Json);
        assert_eq!(
            determine_format(Path::new("out.json"), Some(OutputFormat::Csv)),
            OutputFormat::Csv
        );
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "tach-simgen",
            "--stations",
            "50",
            "--days",
            "30",
            "--schedules",
            "5000",
            "--format",
            "csv",
            "--output",
            "out",
        ])
        .unwrap();
        assert_eq!((cli.stations, cli.days, cli.schedules), (50, 30, 5000));
        assert_eq!(cli.format, Some(OutputFormat::Csv));
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let first = generate(&base_cli()).unwrap();
        let second = generate(&base_cli()).unwrap();
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
        assert_eq!(first.counts().programs, 3 * 2 * 4);
    }

    #[test]
    fn json_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        let dataset = generate(&base_cli()).unwrap();
        emit_json(&dataset, &path).unwrap();
        let parsed: Dataset = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(parsed, dataset);
    }

    #[test]
    fn stations_without_days_still_error_when_schedules_requested() {
        let mut cli = base_cli();
        cli.days = 0;
        assert!(generate(&cli).is_err());
    }
}
