//! Session configuration
//!
//! One immutable [`SessionConfig`] is built before a session starts and
//! handed to the controller. It is stored as JSON; every field has a
//! default so partial files load.

use crate::correction::{StepLimits, DEFAULT_STRATEGY, NO_FILTER};
use crate::device::{AcquisitionSettings, WriteMethod, WriterConfig};
use crate::trace::DEFAULT_PULSE_POINTS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn default_gain() -> f64 {
    0.1
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_percent_change() -> f64 {
    25.0
}

fn default_prefix() -> String {
    "AWG".to_string()
}

fn default_pulse_size() -> usize {
    DEFAULT_PULSE_POINTS
}

fn default_zero_shift() -> f64 {
    0.1
}

fn default_noise_threshold() -> f64 {
    1.0
}

fn default_peak_power_limit() -> f64 {
    4.0
}

fn default_auto_loop_wait() -> f64 {
    5.0
}

fn default_awg_write_wait() -> f64 {
    0.01
}

fn default_scope_wait() -> f64 {
    0.1
}

fn default_scan_settle() -> f64 {
    1.0
}

fn default_busy_poll() -> f64 {
    0.01
}

fn default_busy_timeout() -> f64 {
    5.0
}

fn default_averages() -> usize {
    1
}

fn default_strategy() -> String {
    DEFAULT_STRATEGY.to_string()
}

fn default_filter() -> String {
    NO_FILTER.to_string()
}

fn default_diag_dir() -> PathBuf {
    PathBuf::from("diag")
}

/// Correction loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSettings {
    /// Damping applied to the raw correction, in (0, 1]
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// RMS error below which an automatic session has converged
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Largest step per iteration, in percent
    #[serde(default = "default_max_percent_change")]
    pub max_percent_change: f64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            gain: default_gain(),
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            max_percent_change: default_max_percent_change(),
        }
    }
}

/// Output device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwgSettings {
    /// PV prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Samples in one pulse
    #[serde(default = "default_pulse_size")]
    pub pulse_size: usize,
    /// Offset seeded on the first iteration where the output is at noise level
    #[serde(default = "default_zero_shift")]
    pub zero_shift: f64,
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold_percent: f64,
    #[serde(default)]
    pub write_method: WriteMethod,
    /// Read the buffer through the ASCII readback PV
    #[serde(default)]
    pub ascii_readback: bool,
}

impl Default for AwgSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            pulse_size: default_pulse_size(),
            zero_shift: default_zero_shift(),
            noise_threshold_percent: default_noise_threshold(),
            write_method: WriteMethod::default(),
            ascii_readback: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySettings {
    /// Highest allowed `1 / mean(next)`
    #[serde(default = "default_peak_power_limit")]
    pub peak_power_limit: f64,
    /// Proceed after a countdown instead of asking the operator
    #[serde(default)]
    pub auto_loop: bool,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            peak_power_limit: default_peak_power_limit(),
            auto_loop: false,
        }
    }
}

/// Delays, all in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_auto_loop_wait")]
    pub auto_loop_wait: f64,
    /// Pause after each point write
    #[serde(default = "default_awg_write_wait")]
    pub awg_write_wait: f64,
    /// Pause after each scope read
    #[serde(default = "default_scope_wait")]
    pub scope_wait: f64,
    /// Pause after disabling the AWG self-scan
    #[serde(default = "default_scan_settle")]
    pub scan_settle: f64,
    #[serde(default = "default_busy_poll")]
    pub busy_poll_interval: f64,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: f64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            auto_loop_wait: default_auto_loop_wait(),
            awg_write_wait: default_awg_write_wait(),
            scope_wait: default_scope_wait(),
            scan_settle: default_scan_settle(),
            busy_poll_interval: default_busy_poll(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl TimingSettings {
    /// No delays at all, for simulation and tests
    pub fn immediate() -> Self {
        Self {
            auto_loop_wait: 0.0,
            awg_write_wait: 0.0,
            scope_wait: 0.0,
            scan_settle: 0.0,
            busy_poll_interval: 0.0,
            busy_timeout: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSettings {
    /// Scope records averaged per measurement
    #[serde(default = "default_averages")]
    pub averages: usize,
    /// `[start, length]` of the pulse inside a scope record
    #[serde(default)]
    pub crop: Option<[usize; 2]>,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            averages: default_averages(),
            crop: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            filter: default_filter(),
        }
    }
}

/// Per-iteration diagnostic files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_diag_dir")]
    pub directory: PathBuf,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_diag_dir(),
        }
    }
}

/// Everything a session needs to know up front
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, rename = "loop")]
    pub control: LoopSettings,
    #[serde(default)]
    pub awg: AwgSettings,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub feedback: FeedbackSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,
    /// Treat the applied waveform as the measured output; no device I/O
    #[serde(default)]
    pub loopback: bool,
}

impl SessionConfig {
    /// Load config from disk, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match Self::load_strict(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "Loaded config from disk");
                config
            }
            Err(ConfigError::Io(e)) => {
                tracing::info!(path = %path.display(), error = %e, "No config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Load and validate config, reporting any problem
    pub fn load_strict(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Check every range constraint, reporting the first violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gain = self.control.gain;
        if !(gain > 0.0 && gain <= 1.0) {
            return Err(invalid("loop.gain", format!("{gain} is outside (0, 1]")));
        }
        if self.awg.pulse_size == 0 {
            return Err(invalid("awg.pulse_size", "must be positive".to_string()));
        }
        if self.feedback.averages == 0 {
            return Err(invalid("feedback.averages", "must be positive".to_string()));
        }

        let non_negative = [
            ("loop.tolerance", self.control.tolerance),
            ("loop.max_percent_change", self.control.max_percent_change),
            ("awg.zero_shift", self.awg.zero_shift),
            ("awg.noise_threshold_percent", self.awg.noise_threshold_percent),
            ("safety.peak_power_limit", self.safety.peak_power_limit),
            ("timing.auto_loop_wait", self.timing.auto_loop_wait),
            ("timing.awg_write_wait", self.timing.awg_write_wait),
            ("timing.scope_wait", self.timing.scope_wait),
            ("timing.scan_settle", self.timing.scan_settle),
            ("timing.busy_poll_interval", self.timing.busy_poll_interval),
            ("timing.busy_timeout", self.timing.busy_timeout),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("{value} must be a non-negative number")));
            }
        }
        Ok(())
    }

    /// Limits for the correction pipeline
    pub fn step_limits(&self) -> StepLimits {
        StepLimits {
            max_percent_change: self.control.max_percent_change,
            noise_threshold_percent: self.awg.noise_threshold_percent,
            zero_shift_offset: self.awg.zero_shift,
        }
    }

    /// Writer settings for the configured AWG
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            pulse_size: self.awg.pulse_size,
            max_percent_change: self.control.max_percent_change,
            method: self.awg.write_method,
            write_pacing: seconds(self.timing.awg_write_wait),
            scan_settle: seconds(self.timing.scan_settle),
            busy_poll_interval: seconds(self.timing.busy_poll_interval),
            busy_timeout: seconds(self.timing.busy_timeout),
        }
    }

    /// Averaging and crop settings for the feedback source
    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            averages: self.feedback.averages,
            wait: seconds(self.timing.scope_wait),
            crop: self.feedback.crop.map(|[start, length]| (start, length)),
            pulse_size: self.awg.pulse_size,
        }
    }

    /// Countdown before an automatic iteration
    pub fn auto_loop_wait(&self) -> Duration {
        seconds(self.timing.auto_loop_wait)
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

/// Seconds to a duration; negative or non-finite values give zero
fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
