//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Synthetic dataset model, generation, verification, and export."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Synthetic broadcast datasets: stations, the programs they air, and the
//! recording schedules that reference those programs.

pub mod export;
pub mod generator;
pub mod model;
pub mod verify;

pub use export::{write_csv_dir, write_json, CsvPaths};
pub use generator::{DatasetGenerator, GenerationError};
pub use model::{Dataset, DatasetCounts, Program, RecurrenceKind, RecurrenceRule, Schedule, Station};
pub use verify::IntegrityError;
