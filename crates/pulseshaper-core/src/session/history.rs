//! Per-iteration session record

use super::SessionState;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// One pass through the loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub timestamp: DateTime<Local>,
    pub iteration: u32,
    pub gain: f64,
    /// RMS error after this iteration; `None` when undefined
    pub rms_error: Option<f64>,
    /// Peak power of the proposed waveform; `None` when unbounded
    pub peak_power: Option<f64>,
    /// Whether the waveform reached the device
    pub applied: bool,
}

impl IterationRecord {
    pub fn new(iteration: u32, gain: f64, rms_error: f64, peak_power: f64, applied: bool) -> Self {
        Self {
            timestamp: Local::now(),
            iteration,
            gain,
            rms_error: rms_error.is_finite().then_some(rms_error),
            peak_power: peak_power.is_finite().then_some(peak_power),
            applied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistory {
    pub started: DateTime<Local>,
    pub strategy: String,
    pub filter: Option<String>,
    /// Terminal state, once reached
    pub outcome: Option<SessionState>,
    pub records: Vec<IterationRecord>,
}

impl SessionHistory {
    pub fn new(strategy: &str, filter: Option<&str>) -> Self {
        Self {
            started: Local::now(),
            strategy: strategy.to_string(),
            filter: filter.map(str::to_string),
            outcome: None,
            records: Vec::new(),
        }
    }

    /// Append one iteration
    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    /// Most recent record, applied or not
    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// Number of waveforms that reached the device
    pub fn applied_count(&self) -> usize {
        self.records.iter().filter(|r| r.applied).count()
    }

    /// Lowest defined RMS error seen
    pub fn best_rms(&self) -> Option<f64> {
        self.records
            .iter()
            .filter_map(|r| r.rms_error)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
