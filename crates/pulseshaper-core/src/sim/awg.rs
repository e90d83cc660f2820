//! In-memory AWG
//!
//! Serves the same PV names as the real device. Clones share one buffer, so
//! a test can hand one clone to the writer and inspect another.

use crate::device::{DeviceError, ProcessVariables, PvNames};
use std::sync::{Arc, Mutex, MutexGuard};

/// One recorded PV write
#[derive(Debug, Clone, PartialEq)]
pub struct PvWrite {
    pub pv: String,
    pub value: f64,
}

#[derive(Debug)]
struct AwgState {
    prefix: String,
    dac: f64,
    samples: Vec<f64>,
    hold: Vec<f64>,
    scan_disabled: bool,
    busy_polls: u32,
    busy_remaining: u32,
    stuck_busy: bool,
    connected: bool,
    commits: u32,
    writes: Vec<PvWrite>,
    /// Sample writes issued while the self-scan was running
    unbracketed: usize,
}

/// Simulated AWG backed by a shared buffer
#[derive(Debug, Clone)]
pub struct SimulatedAwg {
    state: Arc<Mutex<AwgState>>,
}

impl SimulatedAwg {
    pub fn new(prefix: &str, dac_full_scale: f64, samples: Vec<f64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AwgState {
                prefix: prefix.to_string(),
                dac: dac_full_scale,
                hold: samples.clone(),
                samples,
                scan_disabled: false,
                busy_polls: 0,
                busy_remaining: 0,
                stuck_busy: false,
                connected: true,
                commits: 0,
                writes: Vec::new(),
                unbracketed: 0,
            })),
        }
    }

    /// Report busy for `polls` reads after every commit
    pub fn with_busy_polls(self, polls: u32) -> Self {
        self.state().busy_polls = polls;
        self
    }

    /// Never finish a commit
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.state().stuck_busy = stuck;
    }

    /// Make every PV access fail while disconnected
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// PV names this device answers to
    pub fn names(&self) -> PvNames {
        PvNames::new(self.state().prefix.clone(), false)
    }

    pub fn dac_full_scale(&self) -> f64 {
        self.state().dac
    }

    /// Device buffer, device units
    pub fn samples(&self) -> Vec<f64> {
        self.state().samples.clone()
    }

    /// Device buffer divided by full scale
    pub fn normalized(&self) -> Vec<f64> {
        let state = self.state();
        state.samples.iter().map(|v| v / state.dac).collect()
    }

    /// Every PV write so far, in order
    pub fn writes(&self) -> Vec<PvWrite> {
        self.state().writes.clone()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Bulk commits seen so far
    pub fn commits(&self) -> u32 {
        self.state().commits
    }

    /// Sample writes made while the self-scan was running
    pub fn unbracketed_writes(&self) -> usize {
        self.state().unbracketed
    }

    /// Whether the self-scan is currently paused
    pub fn scan_disabled(&self) -> bool {
        self.state().scan_disabled
    }

    fn state(&self) -> MutexGuard<'_, AwgState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AwgState {
    /// Strip `{prefix}:` from a PV name
    fn field<'a>(&self, pv: &'a str) -> Result<&'a str, DeviceError> {
        pv.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| unknown(pv))
    }

    fn check_connected(&self) -> Result<(), DeviceError> {
        if self.connected {
            Ok(())
        } else {
            Err(DeviceError::Disconnected(self.prefix.clone()))
        }
    }

    fn index(&self, pv: &str, digits: &str) -> Result<usize, DeviceError> {
        let index: usize = digits.parse().map_err(|_| unknown(pv))?;
        if index >= self.samples.len() {
            return Err(DeviceError::Pv {
                pv: pv.to_string(),
                reason: format!("index beyond buffer of {}", self.samples.len()),
            });
        }
        Ok(index)
    }
}

fn unknown(pv: &str) -> DeviceError {
    DeviceError::Pv {
        pv: pv.to_string(),
        reason: "no such PV".to_string(),
    }
}

impl ProcessVariables for SimulatedAwg {
    fn get_scalar(&mut self, pv: &str) -> Result<f64, DeviceError> {
        let mut state = self.state();
        state.check_connected()?;
        match state.field(pv)? {
            "DAC" => Ok(state.dac),
            "_SelScanDisable" => Ok(if state.scan_disabled { 1.0 } else { 0.0 }),
            "SetWaveformBusy" => {
                if state.stuck_busy {
                    Ok(1.0)
                } else if state.busy_remaining > 0 {
                    state.busy_remaining -= 1;
                    Ok(1.0)
                } else {
                    Ok(0.0)
                }
            }
            _ => Err(unknown(pv)),
        }
    }

    fn get_array(&mut self, pv: &str) -> Result<Vec<f64>, DeviceError> {
        let state = self.state();
        state.check_connected()?;
        match state.field(pv)? {
            "ReadWaveform_do" | "ReadWaveform_ascii_do" => Ok(state.samples.clone()),
            _ => Err(unknown(pv)),
        }
    }

    fn put(&mut self, pv: &str, value: f64) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.check_connected()?;
        let field = state.field(pv)?;

        if field == "_SelScanDisable" {
            state.scan_disabled = value != 0.0;
        } else if field == "SetWaveform.PROC" {
            state.samples = state.hold.clone();
            state.commits += 1;
            state.busy_remaining = state.busy_polls;
        } else if let Some(digits) = field
            .strip_prefix("_SetSample")
            .and_then(|rest| rest.strip_suffix("_do"))
        {
            let i = state.index(pv, digits)?;
            state.samples[i] = value;
            state.hold[i] = value;
            if !state.scan_disabled {
                state.unbracketed += 1;
            }
        } else if let Some(digits) = field.strip_prefix("HoldSample") {
            let i = state.index(pv, digits)?;
            state.hold[i] = value;
            if !state.scan_disabled {
                state.unbracketed += 1;
            }
        } else {
            return Err(unknown(pv));
        }

        state.writes.push(PvWrite {
            pv: pv.to_string(),
            value,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_write_updates_buffer() {
        let awg = SimulatedAwg::new("AWG", 100.0, vec![0.0; 3]);
        let mut pvs = awg.clone();
        pvs.put("AWG:_SetSample1_do", 40.0).unwrap();
        assert_eq!(awg.samples(), vec![0.0, 40.0, 0.0]);
        assert_eq!(awg.normalized()[1], 0.4);
        assert_eq!(awg.unbracketed_writes(), 1);
    }

    #[test]
    fn test_commit_copies_hold_registers() {
        let awg = SimulatedAwg::new("AWG", 100.0, vec![0.0; 2]).with_busy_polls(2);
        let mut pvs = awg.clone();
        pvs.put("AWG:_SelScanDisable", 1.0).unwrap();
        pvs.put("AWG:HoldSample0", 7.0).unwrap();
        assert_eq!(awg.samples(), vec![0.0, 0.0]);

        pvs.put("AWG:SetWaveform.PROC", 1.0).unwrap();
        assert_eq!(awg.samples(), vec![7.0, 0.0]);
        assert_eq!(pvs.get_scalar("AWG:SetWaveformBusy").unwrap(), 1.0);
        assert_eq!(pvs.get_scalar("AWG:SetWaveformBusy").unwrap(), 1.0);
        assert_eq!(pvs.get_scalar("AWG:SetWaveformBusy").unwrap(), 0.0);
        assert_eq!(awg.unbracketed_writes(), 0);
    }

    #[test]
    fn test_unknown_and_out_of_range_pvs() {
        let mut awg = SimulatedAwg::new("AWG", 100.0, vec![0.0; 2]);
        assert!(awg.put("AWG:_SetSample2_do", 1.0).is_err());
        assert!(awg.put("OTHER:DAC", 1.0).is_err());
        assert!(awg.get_scalar("AWG:Nope").is_err());
        assert!(awg.writes().is_empty());
    }

    #[test]
    fn test_disconnected() {
        let mut awg = SimulatedAwg::new("AWG", 100.0, vec![0.0; 2]);
        awg.set_connected(false);
        assert_eq!(
            awg.get_scalar("AWG:DAC"),
            Err(DeviceError::Disconnected("AWG".into()))
        );
    }
}
