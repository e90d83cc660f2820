//! Diagnostic files
//!
//! Every applied iteration leaves plain one-value-per-line files behind,
//! all sharing a timestamp root taken when the session starts:
//!
//! - `{root}_target.txt`, `{root}_background.txt` (first iteration only)
//! - `{root}_i_{iter:05}_AWG_shape.txt`: AWG output before the write
//! - `{root}_i_{iter+1:05}_g_{gain:.2}_correction.txt`: factor applied
//! - `{root}_i_{iter:05}_scope_trace.txt`: feedback the correction used
//!
//! The session history is written as `{root}_history.json` at the end.

use super::history::SessionHistory;
use crate::trace::write_column;
use chrono::Local;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize history: {0}")]
    Json(#[from] serde_json::Error),
}

/// Data saved for one iteration
#[derive(Debug, Clone, Copy)]
pub struct IterationFiles<'a> {
    pub iteration: u32,
    pub gain: f64,
    pub target: &'a [f64],
    pub background: Option<&'a [f64]>,
    pub awg_now: &'a [f64],
    pub factor: &'a [f64],
    pub scope_trace: &'a [f64],
}

#[derive(Debug, Clone)]
pub struct DiagnosticWriter {
    dir: PathBuf,
    root: String,
}

impl DiagnosticWriter {
    /// Create `dir` if needed and stamp the file root with the current minute
    pub fn new(dir: &Path) -> Result<Self, DiagnosticsError> {
        let root = Local::now().format("%Y_%m_%d_%Hh%M").to_string();
        Self::with_root(dir, &root)
    }

    /// Use a fixed file root instead of the current time
    pub fn with_root(dir: &Path, root: &str) -> Result<Self, DiagnosticsError> {
        std::fs::create_dir_all(dir).map_err(|source| DiagnosticsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            root: root.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Prefix shared by every file of this session
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Write the files for one iteration, returning their paths
    pub fn write_iteration(&self, files: &IterationFiles<'_>) -> Result<Vec<PathBuf>, DiagnosticsError> {
        let i = files.iteration;
        let mut outputs: Vec<(String, &[f64])> = Vec::with_capacity(5);

        if i == 0 {
            outputs.push(("target".to_string(), files.target));
            if let Some(background) = files.background {
                outputs.push(("background".to_string(), background));
            }
        }
        outputs.push((format!("i_{:05}_AWG_shape", i), files.awg_now));
        outputs.push((
            format!("i_{:05}_g_{:.2}_correction", i + 1, files.gain),
            files.factor,
        ));
        outputs.push((format!("i_{:05}_scope_trace", i), files.scope_trace));

        let mut written = Vec::with_capacity(outputs.len());
        for (suffix, data) in outputs {
            let path = self.path_for(&format!("{suffix}.txt"));
            write_column(&path, data).map_err(|source| DiagnosticsError::Io {
                path: path.clone(),
                source,
            })?;
            written.push(path);
        }
        tracing::debug!(iteration = i, files = written.len(), "Diagnostic files written");
        Ok(written)
    }

    /// Write `{root}_history.json`, returning its path
    pub fn write_history(&self, history: &SessionHistory) -> Result<PathBuf, DiagnosticsError> {
        let path = self.path_for("history.json");
        let json = history.to_json()?;
        std::fs::write(&path, json).map_err(|source| DiagnosticsError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), "Session history saved");
        Ok(path)
    }

    fn path_for(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", self.root, suffix))
    }
}
