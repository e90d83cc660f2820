//! Process variable access
//!
//! Devices are addressed through named endpoints. The transport (channel
//! access, serial, ...) lives outside this crate behind [`ProcessVariables`].

use super::DeviceError;

/// Read/write access to named process variables
pub trait ProcessVariables: Send {
    fn get_scalar(&mut self, pv: &str) -> Result<f64, DeviceError>;

    fn get_array(&mut self, pv: &str) -> Result<Vec<f64>, DeviceError>;

    fn put(&mut self, pv: &str, value: f64) -> Result<(), DeviceError>;
}

/// PV names for one AWG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvNames {
    prefix: String,
    ascii_readback: bool,
}

impl PvNames {
    pub fn new(prefix: impl Into<String>, ascii_readback: bool) -> Self {
        Self {
            prefix: prefix.into(),
            ascii_readback,
        }
    }

    /// Device prefix shared by every PV
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current device buffer
    pub fn read_waveform(&self) -> String {
        if self.ascii_readback {
            format!("{}:ReadWaveform_ascii_do", self.prefix)
        } else {
            format!("{}:ReadWaveform_do", self.prefix)
        }
    }

    /// Full-scale value
    pub fn dac(&self) -> String {
        format!("{}:DAC", self.prefix)
    }

    /// Immediate single-sample write
    pub fn set_sample(&self, index: usize) -> String {
        format!("{}:_SetSample{}_do", self.prefix, index)
    }

    /// Holding register for bulk writes
    pub fn hold_sample(&self, index: usize) -> String {
        format!("{}:HoldSample{}", self.prefix, index)
    }

    /// Commits all holding registers at once
    pub fn commit(&self) -> String {
        format!("{}:SetWaveform.PROC", self.prefix)
    }

    /// Non-zero while a commit is in progress
    pub fn busy(&self) -> String {
        format!("{}:SetWaveformBusy", self.prefix)
    }

    /// Non-zero pauses the device's periodic self-scan
    pub fn scan_disable(&self) -> String {
        format!("{}:_SelScanDisable", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pv_names() {
        let names = PvNames::new("DIP-AWG", false);
        assert_eq!(names.read_waveform(), "DIP-AWG:ReadWaveform_do");
        assert_eq!(names.dac(), "DIP-AWG:DAC");
        assert_eq!(names.set_sample(12), "DIP-AWG:_SetSample12_do");
        assert_eq!(names.hold_sample(0), "DIP-AWG:HoldSample0");
        assert_eq!(names.commit(), "DIP-AWG:SetWaveform.PROC");
        assert_eq!(names.busy(), "DIP-AWG:SetWaveformBusy");
        assert_eq!(names.scan_disable(), "DIP-AWG:_SelScanDisable");
    }

    #[test]
    fn test_ascii_readback_name() {
        let names = PvNames::new("AWG", true);
        assert_eq!(names.read_waveform(), "AWG:ReadWaveform_ascii_do");
    }
}
