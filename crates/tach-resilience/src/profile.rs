//! ---
//! tach_section: "07-resilience-fault-tolerance"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Network fault profiles, injection, and retry policies."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures for fault profiles and catalogs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProfileError {
    /// Profiles must be addressable by a non-empty name.
    #[error("fault profile name must not be empty")]
    EmptyName,
    /// Loss rate outside `[0, 1]` or not finite.
    #[error("fault profile '{profile}' has loss rate {rate}, expected a value in [0, 1]")]
    InvalidLossRate {
        /// Offending profile.
        profile: String,
        /// Configured rate.
        rate: f64,
    },
    /// No profile with that name exists in the catalog.
    #[error("unknown fault profile '{0}'")]
    Unknown(String),
}

/// Time base in which a profile's delays are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelayMode {
    /// Delay stays in wall-clock time, emulating the physical link regardless of acceleration.
    RealTime,
    /// Delay is virtual time and passes through the run's clock, so it shrinks with acceleration.
    #[default]
    VirtualTime,
}

impl DelayMode {
    /// Static label for logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayMode::RealTime => "real-time",
            DelayMode::VirtualTime => "virtual-time",
        }
    }
}

impl fmt::Display for DelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named network impairment applied to data-plane operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultProfile {
    /// Catalog key.
    pub name: String,
    /// Mean added latency in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
    /// Uniform spread around the latency in milliseconds.
    #[serde(default)]
    pub jitter_ms: u64,
    /// Probability in `[0, 1]` that an operation is dropped.
    #[serde(default)]
    pub loss_rate: f64,
    /// Every data-plane operation fails immediately.
    #[serde(default)]
    pub disconnected: bool,
    /// Time base for latency and loss timeouts.
    #[serde(default)]
    pub delay_mode: DelayMode,
    /// Operator-facing note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FaultProfile {
    /// Name of the zero-impairment profile.
    pub const BASELINE: &'static str = "baseline";

    /// Profile that leaves every operation untouched.
    pub fn baseline() -> Self {
        Self::impaired(Self::BASELINE, 0, 0, 0.0, DelayMode::VirtualTime)
            .describe("no impairment")
    }

    fn impaired(name: &str, latency_ms: u64, jitter_ms: u64, loss_rate: f64, delay_mode: DelayMode) -> Self {
        Self {
            name: name.to_string(),
            latency_ms,
            jitter_ms,
            loss_rate,
            disconnected: false,
            delay_mode,
            description: None,
        }
    }

    fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// True when the profile adds no delay, loss, or refusal.
    pub fn is_zero_impairment(&self) -> bool {
        !self.disconnected && self.latency_ms == 0 && self.jitter_ms == 0 && self.loss_rate == 0.0
    }

    /// Mean latency as a duration.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Check invariants.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        if !self.loss_rate.is_finite() || !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(ProfileError::InvalidLossRate {
                profile: self.name.clone(),
                rate: self.loss_rate,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    profiles: Vec<FaultProfile>,
}

/// Ordered set of fault profiles: the built-ins plus any loaded from TOML.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultProfileCatalog {
    profiles: IndexMap<String, FaultProfile>,
}

impl FaultProfileCatalog {
    /// Catalog containing only the built-in profiles.
    pub fn builtin() -> Self {
        let mut disconnect = FaultProfile::baseline();
        disconnect.name = "disconnect".into();
        disconnect.disconnected = true;
        disconnect.description = Some("link down; every data-plane call is refused".into());

        let profiles = [
            FaultProfile::baseline(),
            FaultProfile::impaired("poor-connection", 500, 150, 0.10, DelayMode::VirtualTime)
                .describe("high latency with moderate loss"),
            FaultProfile::impaired("unstable", 250, 400, 0.30, DelayMode::VirtualTime)
                .describe("heavy jitter with frequent loss"),
            disconnect,
            FaultProfile::impaired("congested-lan", 40, 10, 0.01, DelayMode::RealTime)
                .describe("busy local network, wall-clock delays"),
        ];
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
        }
    }

    /// Load the built-ins extended by the profiles in a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("unable to read fault catalog {}", path.as_ref().display())
        })?;
        contents
            .parse::<Self>()
            .with_context(|| format!("invalid fault catalog {}", path.as_ref().display()))
    }

    /// Add or replace a profile after validating it. Returns the replaced entry.
    pub fn insert(&mut self, profile: FaultProfile) -> Result<Option<FaultProfile>, ProfileError> {
        profile.validate()?;
        Ok(self.profiles.insert(profile.name.clone(), profile))
    }

    /// Look up a profile.
    pub fn get(&self, name: &str) -> Option<&FaultProfile> {
        self.profiles.get(name)
    }

    /// Look up a profile, failing with [`ProfileError::Unknown`].
    pub fn resolve(&self, name: &str) -> Result<FaultProfile, ProfileError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| ProfileError::Unknown(name.to_string()))
    }

    /// Profile names in catalog order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Profiles in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &FaultProfile> {
        self.profiles.values()
    }

    /// Number of profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for FaultProfileCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::str::FromStr for FaultProfileCatalog {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let file = toml::from_str::<CatalogFile>(input).map_err(anyhow::Error::new)?;
        let mut catalog = Self::builtin();
        for profile in file.profiles {
            catalog.insert(profile)?;
        }
        Ok(catalog)
    }
}
