//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Synthetic dataset model, generation, verification, and export."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::prelude::*;
use tach_common::DatasetScale;
use thiserror::Error;
use tracing::debug;

use crate::model::{Dataset, Program, RecurrenceRule, Schedule, Station};
use crate::verify::IntegrityError;

const MINUTES_PER_DAY: u64 = 24 * 60;
const SLOT_MINUTES: u64 = 15;
/// Program lengths are 1..=12 slots, i.e. 15 to 180 minutes.
const MAX_SLOTS: u64 = 12;

const NAME_STEMS: [&str; 8] = [
    "Metro", "Valley", "Harbor", "Summit", "Prairie", "Coastal", "Lakeside", "Canyon",
];
const NAME_SUFFIXES: [&str; 4] = ["Radio", "FM", "Public Media", "Sound"];
const TITLE_LEADS: [&str; 10] = [
    "Morning", "Midday", "Evening", "Late Night", "Weekend", "Classic", "Live", "World", "Local",
    "Open",
];
const TITLE_SUBJECTS: [&str; 10] = [
    "Edition", "Jazz Hour", "News Desk", "Sessions", "Report", "Hits", "Talk", "Concert",
    "Briefing", "Mix",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),
    #[error("invalid generation parameters: {0}")]
    InvalidParameters(String),
    #[error("generated dataset failed verification: {0}")]
    Integrity(#[from] IntegrityError),
}

/// Deterministic generator: the same seed and parameters always produce the same dataset.
#[derive(Debug, Clone)]
pub struct DatasetGenerator {
    seed: u64,
    epoch: DateTime<Utc>,
    programs_per_day: u32,
    regions: Vec<String>,
}

impl DatasetGenerator {
    pub fn new(seed: u64, epoch: DateTime<Utc>) -> Self {
        let defaults = DatasetScale::default();
        Self {
            seed,
            epoch,
            programs_per_day: defaults.programs_per_day,
            regions: defaults.regions,
        }
    }

    pub fn from_scale(scale: &DatasetScale, epoch: DateTime<Utc>) -> Self {
        Self::new(scale.seed, epoch)
            .with_programs_per_day(scale.programs_per_day)
            .with_regions(scale.regions.clone())
    }

    pub fn with_programs_per_day(mut self, programs_per_day: u32) -> Self {
        self.programs_per_day = programs_per_day;
        self
    }

    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    pub fn generate(
        &self,
        station_count: u32,
        program_days_span: u32,
        schedule_count: u32,
    ) -> Result<Dataset, GenerationError> {
        if station_count == 0 && program_days_span > 0 {
            return Err(GenerationError::InsufficientCapacity(format!(
                "{program_days_span} program days requested without any station"
            )));
        }
        if station_count > 0 && self.regions.is_empty() {
            return Err(GenerationError::InvalidParameters(
                "at least one region is required".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let stations = self.stations(&mut rng, station_count);
        let programs = self.programs(&mut rng, &stations, program_days_span);
        if schedule_count > 0 && programs.is_empty() {
            return Err(GenerationError::InsufficientCapacity(format!(
                "{schedule_count} schedules requested but no programs were generated"
            )));
        }
        let schedules = schedules(&mut rng, &programs, schedule_count);

        let dataset = Dataset {
            seed: self.seed,
            epoch: self.epoch,
            stations,
            programs,
            schedules,
        };
        dataset.verify()?;
        debug!(
            target: "tach::sim::generator",
            seed = self.seed,
            stations = dataset.stations.len(),
            programs = dataset.programs.len(),
            schedules = dataset.schedules.len(),
            "dataset generated"
        );
        Ok(dataset)
    }

    fn stations(&self, rng: &mut StdRng, count: u32) -> Vec<Station> {
        (1..=count)
            .map(|id| {
                let idx = (id - 1) as usize;
                let stem = NAME_STEMS.choose(rng).copied().unwrap_or("Metro");
                let suffix = NAME_SUFFIXES.choose(rng).copied().unwrap_or("Radio");
                Station {
                    id,
                    call_sign: call_sign(id),
                    name: format!("{stem} {suffix} {id}"),
                    region: self.regions[idx % self.regions.len()].clone(),
                }
            })
            .collect()
    }

    fn programs(&self, rng: &mut StdRng, stations: &[Station], days: u32) -> Vec<Program> {
        let mut programs = Vec::new();
        for station in stations {
            let mut airings: Vec<(u64, u64, String)> =
                Vec::with_capacity((days * self.programs_per_day) as usize);
            for day in 0..u64::from(days) {
                for _ in 0..self.programs_per_day {
                    let start = day * MINUTES_PER_DAY + rng.gen_range(0..MINUTES_PER_DAY / SLOT_MINUTES) * SLOT_MINUTES;
                    let length = rng.gen_range(1..=MAX_SLOTS) * SLOT_MINUTES;
                    let lead = TITLE_LEADS.choose(rng).copied().unwrap_or("Morning");
                    let subject = TITLE_SUBJECTS.choose(rng).copied().unwrap_or("Edition");
                    airings.push((start, length, format!("{lead} {subject}")));
                }
            }
            airings.sort_by_key(|(start, length, _)| (*start, *length));

            // push overlapping airings back to the end of the one before them
            let mut cursor = 0u64;
            for (start, length, title) in airings {
                let start = start.max(cursor);
                cursor = start + length;
                programs.push(Program {
                    id: 0,
                    station_id: station.id,
                    title,
                    start_offset: Duration::from_secs(start * 60),
                    duration: Duration::from_secs(length * 60),
                });
            }
        }
        for (idx, program) in programs.iter_mut().enumerate() {
            program.id = idx as u32 + 1;
        }
        programs
    }
}

fn schedules(rng: &mut StdRng, programs: &[Program], count: u32) -> Vec<Schedule> {
    let mut schedules = Vec::with_capacity(count as usize);
    let mut references = vec![0u32; programs.len()];
    let mut order: Vec<usize> = (0..programs.len()).collect();
    let mut pass = order.len();
    for id in 1..=count {
        if pass == order.len() {
            order.shuffle(rng);
            pass = 0;
        }
        let idx = order[pass];
        pass += 1;
        let rule = RecurrenceRule::for_reference(references[idx]);
        references[idx] += 1;
        schedules.push(Schedule {
            id,
            program_id: programs[idx].id,
            recurrence: rule,
        });
    }
    schedules
}

fn call_sign(id: u32) -> String {
    let prefix = if id % 2 == 0 { 'W' } else { 'K' };
    let mut letters = [b'A'; 3];
    let mut value = id;
    for slot in letters.iter_mut().rev() {
        *slot = b'A' + (value % 26) as u8;
        value /= 26;
    }
    let suffix = String::from_utf8_lossy(&letters);
    if value == 0 {
        format!("{prefix}{suffix}")
    } else {
        format!("{prefix}{suffix}-{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_704_067_200, 0).unwrap()
    }

    fn generator(seed: u64) -> DatasetGenerator {
        DatasetGenerator::new(seed, epoch())
    }

    #[test]
    fn identical_seeds_produce_identical_json() {
        let first = generator(42).generate(20, 7, 300).unwrap();
        let second = generator(42).generate(20, 7, 300).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
        let other = generator(43).generate(20, 7, 300).unwrap();
        assert_ne!(first.fingerprint().unwrap(), other.fingerprint().unwrap());
    }

    #[test]
    fn programs_never_overlap_within_a_station() {
        let dataset = generator(7)
            .with_programs_per_day(24)
            .generate(5, 10, 0)
            .unwrap();
        let mut by_station: HashMap<u32, Vec<&Program>> = HashMap::new();
        for program in &dataset.programs {
            by_station.entry(program.station_id).or_default().push(program);
        }
        for programs in by_station.values() {
            for pair in programs.windows(2) {
                assert!(pair[0].end_offset() <= pair[1].start_offset);
            }
        }
        assert!(dataset
            .programs
            .iter()
            .all(|p| p.duration >= Duration::from_secs(900) && p.duration <= Duration::from_secs(10_800)));
    }

    #[test]
    fn schedules_reference_existing_programs() {
        let dataset = generator(9).generate(50, 30, 5_000).unwrap();
        assert_eq!(dataset.counts().stations, 50);
        assert_eq!(dataset.counts().programs, 50 * 30 * 4);
        assert_eq!(dataset.schedules.len(), 5_000);
        let ids: HashSet<u32> = dataset.programs.iter().map(|p| p.id).collect();
        assert!(dataset.schedules.iter().all(|s| ids.contains(&s.program_id)));
        let regions: HashSet<&str> = dataset.stations.iter().map(|s| s.region.as_str()).collect();
        assert_eq!(regions.len(), 5);
    }

    #[test]
    fn oversubscribed_schedules_carry_distinct_rules() {
        let dataset = generator(11).generate(1, 1, 10).unwrap();
        assert_eq!(dataset.programs.len(), 4);
        let mut seen: HashMap<u32, HashSet<RecurrenceRule>> = HashMap::new();
        for schedule in &dataset.schedules {
            assert!(seen
                .entry(schedule.program_id)
                .or_default()
                .insert(schedule.recurrence));
        }
        // 10 references over 4 programs: every program is hit two or three times
        assert!(seen.values().all(|rules| (2..=3).contains(&rules.len())));
    }

    #[test]
    fn capacity_errors_are_reported() {
        assert!(matches!(
            generator(1).generate(0, 3, 0),
            Err(GenerationError::InsufficientCapacity(_))
        ));
        assert!(matches!(
            generator(1).generate(3, 0, 10),
            Err(GenerationError::InsufficientCapacity(_))
        ));
        let empty = generator(1).generate(0, 0, 0).unwrap();
        assert_eq!(empty.counts().programs, 0);
        assert!(matches!(
            generator(1).with_regions(Vec::new()).generate(2, 1, 0),
            Err(GenerationError::InvalidParameters(_))
        ));
    }

    #[test]
    fn call_signs_are_unique() {
        let signs: HashSet<String> = (1..=20_000).map(call_sign).collect();
        assert_eq!(signs.len(), 20_000);
    }
}
