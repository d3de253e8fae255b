//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Synthetic dataset model, generation, verification, and export."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::model::{Dataset, Program};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("duplicate {entity} id {id}")]
    DuplicateId { entity: &'static str, id: u32 },
    #[error("program {program} references missing station {station}")]
    DanglingStation { program: u32, station: u32 },
    #[error("schedule {schedule} references missing program {program}")]
    DanglingProgram { schedule: u32, program: u32 },
    #[error("program {program} has zero duration")]
    ZeroDuration { program: u32 },
    #[error("programs {first} and {second} overlap on station {station}")]
    Overlap { station: u32, first: u32, second: u32 },
}

impl Dataset {
    /// Check id uniqueness, referential integrity, and per-station non-overlap.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let mut station_ids = HashSet::with_capacity(self.stations.len());
        for station in &self.stations {
            if !station_ids.insert(station.id) {
                return Err(IntegrityError::DuplicateId { entity: "station", id: station.id });
            }
        }

        let mut program_ids = HashSet::with_capacity(self.programs.len());
        let mut by_station: HashMap<u32, Vec<&Program>> = HashMap::new();
        for program in &self.programs {
            if !program_ids.insert(program.id) {
                return Err(IntegrityError::DuplicateId { entity: "program", id: program.id });
            }
            if !station_ids.contains(&program.station_id) {
                return Err(IntegrityError::DanglingStation {
                    program: program.id,
                    station: program.station_id,
                });
            }
            if program.duration.is_zero() {
                return Err(IntegrityError::ZeroDuration { program: program.id });
            }
            by_station.entry(program.station_id).or_default().push(program);
        }

        for (station, programs) in by_station.iter_mut() {
            programs.sort_by_key(|program| (program.start_offset, program.id));
            for pair in programs.windows(2) {
                if pair[0].end_offset() > pair[1].start_offset {
                    return Err(IntegrityError::Overlap {
                        station: *station,
                        first: pair[0].id,
                        second: pair[1].id,
                    });
                }
            }
        }

        let mut schedule_ids = HashSet::with_capacity(self.schedules.len());
        for schedule in &self.schedules {
            if !schedule_ids.insert(schedule.id) {
                return Err(IntegrityError::DuplicateId { entity: "schedule", id: schedule.id });
            }
            if !program_ids.contains(&schedule.program_id) {
                return Err(IntegrityError::DanglingProgram {
                    schedule: schedule.id,
                    program: schedule.program_id,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::DatasetGenerator;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn dataset() -> Dataset {
        let epoch = DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap();
        DatasetGenerator::new(5, epoch).generate(3, 2, 20).unwrap()
    }

    #[test]
    fn generated_dataset_verifies() {
        assert_eq!(dataset().verify(), Ok(()));
    }

    #[test]
    fn dangling_schedule_is_detected() {
        let mut dataset = dataset();
        dataset.schedules[0].program_id = 9_999;
        assert!(matches!(
            dataset.verify(),
            Err(IntegrityError::DanglingProgram { program: 9_999, .. })
        ));
    }

    #[test]
    fn overlap_is_detected() {
        let mut dataset = dataset();
        let first = dataset.programs[0].clone();
        let second = &mut dataset.programs[1];
        second.station_id = first.station_id;
        second.start_offset = first.start_offset + Duration::from_secs(60);
        assert!(matches!(dataset.verify(), Err(IntegrityError::Overlap { .. })));
    }

    #[test]
    fn duplicate_ids_are_detected() {
        let mut dataset = dataset();
        let duplicate = dataset.stations[0].clone();
        dataset.stations.push(duplicate);
        assert!(matches!(
            dataset.verify(),
            Err(IntegrityError::DuplicateId { entity: "station", .. })
        ));
    }
}
