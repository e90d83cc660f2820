//! Fixed-order trace processing pipeline
//!
//! Stages always run in the same order regardless of how they are listed:
//!
//! ```text
//! background subtraction -> crop -> resample -> clip -> normalize
//! ```
//!
//! Each stage reads the previous stage's output. The pipeline is pure: it
//! takes a trace and a list of stage requests and returns a new buffer.

use super::curve::Trace;
use super::TraceError;
use std::fmt;
use std::str::FromStr;

/// Pipeline stage identifier
///
/// Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    SubtractBackground,
    Crop,
    Resample,
    Clip,
    Normalize,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::SubtractBackground => "bkg",
            StageKind::Crop => "crop",
            StageKind::Resample => "resample",
            StageKind::Clip => "clip",
            StageKind::Normalize => "norm",
        };
        f.write_str(name)
    }
}

impl FromStr for StageKind {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bkg" | "background" => Ok(StageKind::SubtractBackground),
            "crop" => Ok(StageKind::Crop),
            "resample" => Ok(StageKind::Resample),
            "clip" => Ok(StageKind::Clip),
            "norm" | "normalize" | "normalise" => Ok(StageKind::Normalize),
            other => Err(TraceError::UnknownStage(other.to_string())),
        }
    }
}

/// A single stage request with its parameters
#[derive(Debug, Clone, Copy)]
pub enum Stage<'a> {
    /// Subtract the background's raw samples elementwise
    SubtractBackground(&'a Trace),
    /// Keep `[start, start + length)`
    Crop { start: usize, length: usize },
    /// Linear interpolation onto `n` evenly spaced points
    Resample(usize),
    /// Floor negative values at zero
    Clip,
    /// Divide by the maximum absolute value
    Normalize,
}

impl Stage<'_> {
    /// Stage this request entry selects
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::SubtractBackground(_) => StageKind::SubtractBackground,
            Stage::Crop { .. } => StageKind::Crop,
            Stage::Resample(_) => StageKind::Resample,
            Stage::Clip => StageKind::Clip,
            Stage::Normalize => StageKind::Normalize,
        }
    }
}

/// Per-call pipeline parameters
///
/// Every stage is optional and toggled independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRequest<'a> {
    pub background: Option<&'a Trace>,
    /// `(start, length)`
    pub crop: Option<(usize, usize)>,
    pub resample_to: Option<usize>,
    pub clip: bool,
    pub normalize: bool,
}

impl<'a> ProcessRequest<'a> {
    /// Expand into the list of requested stages
    pub fn stages(&self) -> Vec<Stage<'a>> {
        let mut stages = Vec::with_capacity(5);
        if let Some(bkg) = self.background {
            stages.push(Stage::SubtractBackground(bkg));
        }
        if let Some((start, length)) = self.crop {
            stages.push(Stage::Crop { start, length });
        }
        if let Some(n) = self.resample_to {
            stages.push(Stage::Resample(n));
        }
        if self.clip {
            stages.push(Stage::Clip);
        }
        if self.normalize {
            stages.push(Stage::Normalize);
        }
        stages
    }
}

/// Stateless trace transform pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceProcessor;

impl TraceProcessor {
    /// Run the stages described by `request` on `trace`'s raw samples
    pub fn process(trace: &Trace, request: &ProcessRequest<'_>) -> Result<Vec<f64>, TraceError> {
        Self::run(trace, &request.stages())
    }

    /// Run an explicit list of stages on `trace`'s raw samples
    ///
    /// The list is reordered into pipeline order. A stage listed twice is
    /// rejected, as is background subtraction on a trace kind that does
    /// not support it.
    pub fn run(trace: &Trace, stages: &[Stage<'_>]) -> Result<Vec<f64>, TraceError> {
        let mut ordered: Vec<&Stage<'_>> = stages.iter().collect();
        ordered.sort_by_key(|s| s.kind());
        if let Some(pair) = ordered.windows(2).find(|w| w[0].kind() == w[1].kind()) {
            return Err(TraceError::DuplicateStage(pair[0].kind()));
        }

        let mut buffer = trace.raw().to_vec();
        for stage in ordered {
            buffer = match *stage {
                Stage::SubtractBackground(bkg) => {
                    if !trace.kind().supports_background_subtraction() {
                        return Err(TraceError::UnsupportedOperation {
                            stage: StageKind::SubtractBackground,
                            kind: trace.kind(),
                        });
                    }
                    Self::subtract(&buffer, bkg.raw())?
                }
                Stage::Crop { start, length } => Self::crop(&buffer, start, length)?,
                Stage::Resample(n) => Self::resample(&buffer, n)?,
                Stage::Clip => Self::clip_negative(&buffer),
                Stage::Normalize => Self::normalize(&buffer),
            };
        }
        Ok(buffer)
    }

    /// Elementwise `data - background`
    pub fn subtract(data: &[f64], background: &[f64]) -> Result<Vec<f64>, TraceError> {
        if data.len() != background.len() {
            return Err(TraceError::LengthMismatch {
                expected: data.len(),
                actual: background.len(),
            });
        }
        Ok(data.iter().zip(background).map(|(d, b)| d - b).collect())
    }

    /// Slice `[start, start + length)`
    pub fn crop(data: &[f64], start: usize, length: usize) -> Result<Vec<f64>, TraceError> {
        let end = start.checked_add(length).filter(|&end| end <= data.len());
        match end {
            Some(end) => Ok(data[start..end].to_vec()),
            None => Err(TraceError::Range {
                start,
                length,
                available: data.len(),
            }),
        }
    }

    /// Evaluate the piecewise-linear interpolant of `data` at `n` evenly
    /// spaced positions from index 0 to the last index
    pub fn resample(data: &[f64], n: usize) -> Result<Vec<f64>, TraceError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let Some(&last) = data.last() else {
            return Err(TraceError::EmptyInput(StageKind::Resample));
        };
        if n == 1 || data.len() == 1 {
            return Ok(vec![data[0]; n]);
        }

        let span = (data.len() - 1) as f64;
        let step = span / (n - 1) as f64;
        let out = (0..n)
            .map(|i| {
                let pos = i as f64 * step;
                let lo = pos.floor() as usize;
                if lo >= data.len() - 1 {
                    return last;
                }
                let frac = pos - lo as f64;
                data[lo] + (data[lo + 1] - data[lo]) * frac
            })
            .collect();
        Ok(out)
    }

    /// Replace negative values with zero
    pub fn clip_negative(data: &[f64]) -> Vec<f64> {
        data.iter().map(|&x| x.max(0.0)).collect()
    }

    /// Divide by the maximum absolute value; all-zero input is returned as-is
    pub fn normalize(data: &[f64]) -> Vec<f64> {
        let peak = data.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()));
        if peak == 0.0 {
            return data.to_vec();
        }
        data.iter().map(|&x| x / peak).collect()
    }
}
