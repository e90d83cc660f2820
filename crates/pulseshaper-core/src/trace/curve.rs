//! Trace storage and curve files
//!
//! A trace keeps the samples it was created with untouched. Every call to
//! [`Trace::process`] rebuilds the processed view from the raw samples, so
//! two differently-parameterized calls never see each other's state.
//!
//! Curve files are plain text with one value per line.

use super::processor::{ProcessRequest, TraceProcessor};
use super::TraceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Default number of samples in one AWG pulse
pub const DEFAULT_PULSE_POINTS: usize = 82;

/// Role of a trace in the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// A detector measurement, may be background corrected
    Measurement,
    /// A background recording, never background corrected
    Background,
    /// The desired pulse shape, never background corrected
    Target,
}

impl TraceKind {
    /// Whether a background trace may be subtracted from this kind
    pub fn supports_background_subtraction(self) -> bool {
        matches!(self, TraceKind::Measurement)
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceKind::Measurement => "measurement",
            TraceKind::Background => "background",
            TraceKind::Target => "target",
        };
        f.write_str(name)
    }
}

/// How a loaded curve is fitted to the requested number of points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimMethod {
    /// Linear resample onto `num_points`
    Resample,
    /// Keep the first `num_points`, zero-padding shorter input
    Truncate,
    /// Keep the file contents as-is
    #[default]
    Off,
}

/// Options for [`Trace::load`]
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Target number of points (ignored for [`TrimMethod::Off`])
    pub num_points: usize,
    /// Fitting method
    pub trim: TrimMethod,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            num_points: DEFAULT_PULSE_POINTS,
            trim: TrimMethod::Off,
        }
    }
}

/// Raw samples plus a derived processed view
#[derive(Debug, Clone)]
pub struct Trace {
    name: String,
    kind: TraceKind,
    raw: Vec<f64>,
    processed: Vec<f64>,
}

impl Trace {
    /// Create a trace; the processed view starts out equal to `raw`
    pub fn new(name: impl Into<String>, kind: TraceKind, raw: Vec<f64>) -> Self {
        let processed = raw.clone();
        Self {
            name: name.into(),
            kind,
            raw,
            processed,
        }
    }

    /// Create a detector measurement trace
    pub fn measurement(name: impl Into<String>, raw: Vec<f64>) -> Self {
        Self::new(name, TraceKind::Measurement, raw)
    }

    /// Create a background trace
    pub fn background(name: impl Into<String>, raw: Vec<f64>) -> Self {
        Self::new(name, TraceKind::Background, raw)
    }

    /// Create a target trace
    pub fn target(name: impl Into<String>, raw: Vec<f64>) -> Self {
        Self::new(name, TraceKind::Target, raw)
    }

    /// Load a curve file
    ///
    /// The file is fitted to `options.num_points` according to
    /// `options.trim`, and the result becomes the trace's raw data. The name
    /// defaults to the file name.
    pub fn load(
        path: &Path,
        kind: TraceKind,
        options: LoadOptions,
        name: Option<&str>,
    ) -> Result<Self, TraceError> {
        let values = read_column(path)?;
        let raw = match options.trim {
            TrimMethod::Resample => TraceProcessor::resample(&values, options.num_points)?,
            TrimMethod::Truncate => {
                let mut head: Vec<f64> = values.into_iter().take(options.num_points).collect();
                head.resize(options.num_points, 0.0);
                head
            }
            TrimMethod::Off => values,
        };

        let name = name.map(str::to_string).unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string())
        });

        tracing::debug!(name = %name, kind = %kind, points = raw.len(), "Loaded curve");
        Ok(Self::new(name, kind, raw))
    }

    /// Save the raw or processed samples, one value per line
    pub fn save(&self, path: &Path, raw: bool) -> Result<(), TraceError> {
        let data = if raw { &self.raw } else { &self.processed };
        write_column(path, data)?;
        Ok(())
    }

    /// Recompute the processed view from the raw samples
    ///
    /// On error the processed view is reset to the raw samples so no
    /// partially processed buffer survives.
    pub fn process(&mut self, request: &ProcessRequest<'_>) -> Result<&[f64], TraceError> {
        match TraceProcessor::process(self, request) {
            Ok(processed) => {
                self.processed = processed;
                Ok(&self.processed)
            }
            Err(e) => {
                self.processed = self.raw.clone();
                Err(e)
            }
        }
    }

    /// Label used in logs and file names
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which stages this trace accepts
    pub fn kind(&self) -> TraceKind {
        self.kind
    }

    /// Samples as loaded or measured
    pub fn raw(&self) -> &[f64] {
        &self.raw
    }

    /// Samples after the most recent [`Self::process`] call
    pub fn processed(&self) -> &[f64] {
        &self.processed
    }

    /// Number of points in the processed view
    pub fn point_count(&self) -> usize {
        self.processed.len()
    }
}

/// Read whitespace separated numbers, one or more per line
pub fn read_column(path: &Path) -> Result<Vec<f64>, TraceError> {
    let contents = fs::read_to_string(path)?;
    let mut values = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for token in line.split_whitespace() {
            let value = token.parse::<f64>().map_err(|_| TraceError::Parse {
                line: i + 1,
                value: token.to_string(),
            })?;
            values.push(value);
        }
    }
    Ok(values)
}

/// Write one value per line
pub fn write_column(path: &Path, data: &[f64]) -> std::io::Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for value in data {
        writeln!(out, "{:.18e}", value)?;
    }
    out.flush()
}
