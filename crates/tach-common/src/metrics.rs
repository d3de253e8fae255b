//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Shared primitives and utilities for the harness runtime."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::time::jitter_us;

/// Records how far real sleeps drift from the duration they were asked to cover.
#[derive(Debug, Default)]
pub struct DriftHistogram {
    samples: Mutex<Vec<f64>>,
}

impl DriftHistogram {
    /// Record one observation; positive values mean the sleep overshot.
    pub fn record(&self, actual: Duration, expected: Duration) {
        self.samples.lock().push(jitter_us(actual, expected) as f64);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> Option<DriftSummary> {
        let samples = self.samples.lock();
        let slice = samples.as_slice();
        if slice.is_empty() {
            return None;
        }
        let count = slice.len() as f64;
        let mean = slice.iter().sum::<f64>() / count;
        let variance = if slice.len() > 1 {
            let sum_sq = slice
                .iter()
                .map(|value| {
                    let delta = value - mean;
                    delta * delta
                })
                .sum::<f64>();
            sum_sq / (count - 1.0)
        } else {
            0.0
        };
        let max = slice.iter().copied().fold(f64::MIN, f64::max);
        let min = slice.iter().copied().fold(f64::MAX, f64::min);
        Some(DriftSummary {
            mean_us: mean,
            std_dev_us: variance.sqrt(),
            max_us: max,
            min_us: min,
            samples: slice.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftSummary {
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub max_us: f64,
    pub min_us: f64,
    pub samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_summary() {
        assert!(DriftHistogram::default().summary().is_none());
    }

    #[test]
    fn summary_tracks_signed_drift() {
        let histogram = DriftHistogram::default();
        histogram.record(Duration::from_millis(11), Duration::from_millis(10));
        histogram.record(Duration::from_millis(13), Duration::from_millis(10));
        let summary = histogram.summary().unwrap();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.min_us, 1_000.0);
        assert_eq!(summary.max_us, 3_000.0);
        assert_eq!(summary.mean_us, 2_000.0);
    }
}
