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
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use sha2::{Digest, Sha256};
use tach_common::time::to_chrono;

/// A broadcast station programs are aired on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: u32,
    pub call_sign: String,
    pub name: String,
    pub region: String,
}

/// One airing of a program, positioned in virtual time relative to the dataset epoch.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: u32,
    pub station_id: u32,
    pub title: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub start_offset: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
}

impl Program {
    pub fn end_offset(&self) -> Duration {
        self.start_offset + self.duration
    }

    pub fn starts_at(&self, epoch: DateTime<Utc>) -> DateTime<Utc> {
        epoch + to_chrono(self.start_offset)
    }

    pub fn ends_at(&self, epoch: DateTime<Utc>) -> DateTime<Utc> {
        epoch + to_chrono(self.end_offset())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RecurrenceKind {
    Weekday,
    Weekend,
    Monthly,
    Custom,
}

impl RecurrenceKind {
    /// Round-robin order used when a program is referenced more than once.
    pub const ROTATION: [RecurrenceKind; 4] = [
        RecurrenceKind::Weekday,
        RecurrenceKind::Weekend,
        RecurrenceKind::Monthly,
        RecurrenceKind::Custom,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub kind: RecurrenceKind,
    pub interval: u32,
}

impl RecurrenceRule {
    /// Rule for the `reference`-th (0-based) schedule pointing at the same program.
    pub fn for_reference(reference: u32) -> Self {
        Self {
            kind: RecurrenceKind::ROTATION[(reference % 4) as usize],
            interval: 1 + reference / 4,
        }
    }
}

/// Recording request for a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: u32,
    pub program_id: u32,
    pub recurrence: RecurrenceRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCounts {
    pub stations: usize,
    pub programs: usize,
    pub schedules: usize,
}

/// Generated dataset. Serialises to the same bytes for the same seed and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub seed: u64,
    pub epoch: DateTime<Utc>,
    pub stations: Vec<Station>,
    pub programs: Vec<Program>,
    pub schedules: Vec<Schedule>,
}

impl Dataset {
    pub fn counts(&self) -> DatasetCounts {
        DatasetCounts {
            stations: self.stations.len(),
            programs: self.programs.len(),
            schedules: self.schedules.len(),
        }
    }

    /// Canonical compact JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// SHA-256 hex digest of the canonical JSON.
    pub fn fingerprint(&self) -> serde_json::Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn program(&self, id: u32) -> Option<&Program> {
        // ids are assigned sequentially from 1 in vector order
        self.programs
            .get(id.checked_sub(1)? as usize)
            .filter(|program| program.id == id)
            .or_else(|| self.programs.iter().find(|program| program.id == id))
    }

    pub fn station(&self, id: u32) -> Option<&Station> {
        self.stations
            .get(id.checked_sub(1)? as usize)
            .filter(|station| station.id == id)
            .or_else(|| self.stations.iter().find(|station| station.id == id))
    }
}
