//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Synthetic dataset model, generation, verification, and export."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::Dataset;

/// Files produced by [`write_csv_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvPaths {
    pub stations: PathBuf,
    pub programs: PathBuf,
    pub schedules: PathBuf,
}

#[derive(Serialize)]
struct ProgramRow<'a> {
    id: u32,
    station_id: u32,
    title: &'a str,
    start_offset_secs: u64,
    duration_secs: u64,
    starts_at: String,
}

#[derive(Serialize)]
struct ScheduleRow {
    id: u32,
    program_id: u32,
    kind: &'static str,
    interval: u32,
}

/// Write the dataset as pretty JSON.
pub fn write_json<W: Write>(dataset: &Dataset, mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, dataset).context("failed to encode dataset")?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Write `stations.csv`, `programs.csv`, and `schedules.csv` into `dir`.
pub fn write_csv_dir(dataset: &Dataset, dir: &Path) -> Result<CsvPaths> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let paths = CsvPaths {
        stations: dir.join("stations.csv"),
        programs: dir.join("programs.csv"),
        schedules: dir.join("schedules.csv"),
    };

    let mut stations = csv_writer(&paths.stations)?;
    for station in &dataset.stations {
        stations.serialize(station)?;
    }
    stations.flush()?;

    let mut programs = csv_writer(&paths.programs)?;
    for program in &dataset.programs {
        programs.serialize(ProgramRow {
            id: program.id,
            station_id: program.station_id,
            title: &program.title,
            start_offset_secs: program.start_offset.as_secs(),
            duration_secs: program.duration.as_secs(),
            starts_at: program.starts_at(dataset.epoch).to_rfc3339(),
        })?;
    }
    programs.flush()?;

    let mut schedules = csv_writer(&paths.schedules)?;
    for schedule in &dataset.schedules {
        schedules.serialize(ScheduleRow {
            id: schedule.id,
            program_id: schedule.program_id,
            kind: schedule.recurrence.kind.into(),
            interval: schedule.recurrence.interval,
        })?;
    }
    schedules.flush()?;

    Ok(paths)
}

fn csv_writer(path: &Path) -> Result<csv::Writer<File>> {
    let file = File::create(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    Ok(csv::Writer::from_writer(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::DatasetGenerator;
    use chrono::{DateTime, Utc};

    fn dataset() -> Dataset {
        let epoch = DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap();
        DatasetGenerator::new(21, epoch).generate(4, 3, 25).unwrap()
    }

    #[test]
    fn json_export_round_trips_into_the_same_dataset() {
        let dataset = dataset();
        let mut buffer = Vec::new();
        write_json(&dataset, &mut buffer).unwrap();
        let parsed: Dataset = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed.fingerprint().unwrap(), dataset.fingerprint().unwrap());
    }

    #[test]
    fn csv_export_writes_one_row_per_entity() {
        let dataset = dataset();
        let dir = tempfile::tempdir().unwrap();
        let paths = write_csv_dir(&dataset, dir.path()).unwrap();

        let rows = |path: &Path| csv::Reader::from_path(path).unwrap().records().count();
        assert_eq!(rows(&paths.stations), dataset.stations.len());
        assert_eq!(rows(&paths.programs), dataset.programs.len());
        assert_eq!(rows(&paths.schedules), dataset.schedules.len());

        let header = fs::read_to_string(&paths.schedules).unwrap();
        assert!(header.starts_with("id,program_id,kind,interval"));
    }
}
