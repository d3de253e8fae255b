//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Resource telemetry probes, sampler, and summaries."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use tach_common::TelemetryConfig;
use thiserror::Error;

/// Host units needed to read `/proc/<pid>/stat`.
///
/// Procfs reports CPU time in `USER_HZ` ticks and the resident set in pages.
/// Both are fixed by the kernel build of the observed host, so they come from
/// configuration rather than from the harness binary's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcfsUnits {
    pub clock_ticks_per_sec: u64,
    pub page_size_bytes: u64,
}

impl Default for ProcfsUnits {
    fn default() -> Self {
        Self::from(&TelemetryConfig::default())
    }
}

impl From<&TelemetryConfig> for ProcfsUnits {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            clock_ticks_per_sec: config.clock_ticks_per_sec.max(1),
            page_size_bytes: config.page_size_bytes,
        }
    }
}

/// Failure to obtain a reading; the sampler records it as a gap.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The platform offers no supported source of process statistics.
    #[error("resource probing is not supported on this platform")]
    Unsupported,
    /// A statistics file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A statistics file had an unexpected layout.
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

/// One raw reading of process resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceReading {
    /// CPU utilisation since the previous reading, in percent of one core.
    pub cpu_percent: f64,
    /// Resident set size in bytes.
    pub resident_bytes: u64,
    /// Bytes read plus written per second since the previous reading.
    pub io_bytes_per_sec: f64,
    /// Open file descriptors.
    pub open_handles: u64,
}

/// Source of resource readings polled by the sampler task.
#[async_trait]
pub trait ResourceProbe: Send {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Take one reading.
    async fn probe(&mut self) -> Result<ResourceReading, ProbeError>;
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    at: Instant,
    cpu_ticks: u64,
    io_bytes: Option<u64>,
}

/// Reads `/proc/<pid>/{stat,io,fd}`. Rates are computed from the delta to the
/// previous successful reading, so the first reading reports zero rates.
#[derive(Debug)]
pub struct ProcfsProbe {
    root: PathBuf,
    label: String,
    units: ProcfsUnits,
    previous: Option<Counters>,
}

impl ProcfsProbe {
    /// Probe the current process.
    pub fn current() -> Self {
        Self::with_root(PathBuf::from("/proc/self"), "self".to_string())
    }

    /// Probe another process, such as a locally running collaborator.
    pub fn for_pid(pid: u32) -> Self {
        Self::with_root(PathBuf::from(format!("/proc/{pid}")), format!("pid:{pid}"))
    }

    /// Probe `pid` when given, otherwise the current process.
    pub fn target(pid: Option<u32>) -> Self {
        pid.map(Self::for_pid).unwrap_or_else(Self::current)
    }

    /// Probe the process selected by `config` using its host units.
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::target(config.target_pid).with_units(ProcfsUnits::from(config))
    }

    pub fn with_units(mut self, units: ProcfsUnits) -> Self {
        self.units = units;
        self
    }

    fn with_root(root: PathBuf, label: String) -> Self {
        Self {
            root,
            label,
            units: ProcfsUnits::default(),
            previous: None,
        }
    }

    #[cfg(target_os = "linux")]
    async fn read_counters(&mut self) -> Result<ResourceReading, ProbeError> {
        let stat_path = self.root.join("stat");
        let raw = read(&stat_path).await?;
        let stat = parse_stat(&raw).map_err(|reason| ProbeError::Parse {
            path: stat_path.clone(),
            reason,
        })?;

        // io accounting is often restricted for foreign processes
        let io_bytes = match tokio::fs::read_to_string(self.root.join("io")).await {
            Ok(raw) => parse_io(&raw),
            Err(_) => None,
        };

        let fd_path = self.root.join("fd");
        let mut entries = tokio::fs::read_dir(&fd_path)
            .await
            .map_err(|source| ProbeError::Io {
                path: fd_path.clone(),
                source,
            })?;
        let mut open_handles = 0u64;
        while entries
            .next_entry()
            .await
            .map_err(|source| ProbeError::Io {
                path: fd_path.clone(),
                source,
            })?
            .is_some()
        {
            open_handles += 1;
        }

        let now = Counters {
            at: Instant::now(),
            cpu_ticks: stat.utime + stat.stime,
            io_bytes,
        };
        let (cpu_percent, io_bytes_per_sec) = match self.previous {
            Some(prev) => rates(prev, now, self.units.clock_ticks_per_sec),
            None => (0.0, 0.0),
        };
        self.previous = Some(now);

        Ok(ResourceReading {
            cpu_percent,
            resident_bytes: stat.rss_pages.saturating_mul(self.units.page_size_bytes),
            io_bytes_per_sec,
            open_handles,
        })
    }

    #[cfg(not(target_os = "linux"))]
    async fn read_counters(&mut self) -> Result<ResourceReading, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

#[async_trait]
impl ResourceProbe for ProcfsProbe {
    fn name(&self) -> &str {
        &self.label
    }

    async fn probe(&mut self) -> Result<ResourceReading, ProbeError> {
        self.read_counters().await
    }
}

#[cfg(target_os = "linux")]
async fn read(path: &std::path::Path) -> Result<String, ProbeError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProbeError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn rates(prev: Counters, now: Counters, ticks_per_sec: u64) -> (f64, f64) {
    let wall = now.at.saturating_duration_since(prev.at).as_secs_f64();
    if wall <= 0.0 {
        return (0.0, 0.0);
    }
    let cpu_secs = now.cpu_ticks.saturating_sub(prev.cpu_ticks) as f64 / ticks_per_sec as f64;
    let io = match (prev.io_bytes, now.io_bytes) {
        (Some(before), Some(after)) => after.saturating_sub(before) as f64 / wall,
        _ => 0.0,
    };
    (cpu_secs / wall * 100.0, io)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    utime: u64,
    stime: u64,
    rss_pages: u64,
}

fn parse_stat(raw: &str) -> Result<StatFields, String> {
    // the command name may contain spaces and parentheses; fields restart after the last ')'
    let close = raw
        .rfind(')')
        .ok_or_else(|| "missing command terminator".to_string())?;
    let fields: Vec<&str> = raw[close + 1..].split_whitespace().collect();
    let field = |idx: usize, name: &str| -> Result<u64, String> {
        fields
            .get(idx)
            .ok_or_else(|| format!("missing {name}"))?
            .parse::<i64>()
            .map(|value| value.max(0) as u64)
            .map_err(|err| format!("invalid {name}: {err}"))
    };
    Ok(StatFields {
        utime: field(11, "utime")?,
        stime: field(12, "stime")?,
        rss_pages: field(21, "rss")?,
    })
}

fn parse_io(raw: &str) -> Option<u64> {
    let mut total = None;
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if matches!(key.trim(), "read_bytes" | "write_bytes") {
            let value: u64 = value.trim().parse().ok()?;
            total = Some(total.unwrap_or(0) + value);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const STAT: &str = "4242 (tach worker (x)) S 1 4242 4242 0 -1 4194560 2500 0 0 0 \
                        150 50 0 0 20 0 8 0 123456 104857600 2560 18446744073709551615";

    #[test]
    fn stat_parses_past_parenthesised_names() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(
            stat,
            StatFields {
                utime: 150,
                stime: 50,
                rss_pages: 2560,
            }
        );
    }

    #[test]
    fn stat_rejects_truncated_lines() {
        assert!(parse_stat("12 (short) S 1 2").is_err());
        assert!(parse_stat("no terminator").is_err());
    }

    #[test]
    fn io_sums_storage_bytes() {
        let raw = "rchar: 100\nwchar: 50\nsyscr: 3\nsyscw: 2\nread_bytes: 4096\nwrite_bytes: 8192\ncancelled_write_bytes: 0\n";
        assert_eq!(parse_io(raw), Some(12_288));
        assert_eq!(parse_io("rchar: 1\n"), None);
    }

    #[test]
    fn rates_follow_counter_deltas() {
        let start = Instant::now();
        let prev = Counters {
            at: start,
            cpu_ticks: 100,
            io_bytes: Some(0),
        };
        let now = Counters {
            at: start + Duration::from_secs(2),
            cpu_ticks: 200,
            io_bytes: Some(4_000),
        };
        let (cpu, io) = rates(prev, now, 100);
        assert!((cpu - 50.0).abs() < 1e-9);
        assert!((io - 2_000.0).abs() < 1e-9);

        // same tick delta on a 250 Hz host is less CPU time
        let (cpu, _) = rates(prev, now, 250);
        assert!((cpu - 20.0).abs() < 1e-9);
    }

    #[test]
    fn units_follow_telemetry_config() {
        let config = TelemetryConfig {
            target_pid: Some(1),
            clock_ticks_per_sec: 250,
            page_size_bytes: 16_384,
            ..TelemetryConfig::default()
        };
        let probe = ProcfsProbe::from_config(&config);
        assert_eq!(probe.name(), "pid:1");
        assert_eq!(
            probe.units,
            ProcfsUnits {
                clock_ticks_per_sec: 250,
                page_size_bytes: 16_384,
            }
        );
        assert_eq!(ProcfsUnits::default().page_size_bytes, 4096);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn procfs_probe_reads_current_process() {
        let mut probe = ProcfsProbe::current();
        let first = probe.probe().await.unwrap();
        assert!(first.resident_bytes > 0);
        assert!(first.open_handles > 0);
        assert_eq!(first.cpu_percent, 0.0);
        let second = probe.probe().await.unwrap();
        assert!(second.cpu_percent >= 0.0);
        assert_eq!(probe.name(), "self");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn missing_process_is_an_io_error() {
        let mut probe = ProcfsProbe::for_pid(u32::MAX);
        assert!(matches!(probe.probe().await, Err(ProbeError::Io { .. })));
    }
}
