//! Multi-pass slab amplifier model
//!
//! Frantz-Nodvik style gain saturation through a stack of Yb:YAG slabs.
//! The seed pulse is split into `time_steps` pulselets; each one depletes
//! the upper-level population seen by the pulselets behind it, so the
//! leading edge is amplified more than the tail. That reshaping is what
//! the feedback loop has to pre-compensate.

use crate::trace::TraceProcessor;

/// Speed of light, m/s
const C: f64 = 3e8;
/// Planck's constant, J s
const H: f64 = 6.626e-34;
/// Laser wavelength, nm
const WAVELENGTH_NM: f64 = 1030.0;
/// Stored fluence, J/cm²
const STORED_FLUENCE: f64 = 4.0;
/// Gain medium thickness, cm
const CRYSTAL_LENGTH: f64 = 2.0;
/// Seed aperture (square), cm
const CRYSTAL_WIDTH: f64 = 2.15;
/// Doping atoms per cm² (concentration times length)
const DOPING_INTEGRATED: f64 = 4.38e20;
/// Thermal population fraction of the lower laser level
const LOWER_LEVEL_FRACTION: f64 = 0.3 * 0.01;
/// Emission cross section, cm²
const SIGMA_EMISSION: f64 = 6.3e-20;
/// Loss between slabs
const SLAB_LOSS: f64 = 0.5 * 0.01;
/// Loss after each pass
const END_LOSS: f64 = 5.0 * 0.01;

/// Free parameters of the amplifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmplifierParams {
    /// Seed energy, J
    pub input_energy: f64,
    /// Seed duration, s
    pub input_pulse_length: f64,
    pub time_steps: usize,
    pub slabs: usize,
    pub passes: usize,
}

impl Default for AmplifierParams {
    fn default() -> Self {
        Self {
            input_energy: 30e-3,
            input_pulse_length: 10e-9,
            time_steps: 100,
            slabs: 4,
            passes: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AmplifierModel {
    params: AmplifierParams,
    photon_energy: f64,
    doping: f64,
    slab_length: f64,
    /// Fractional upper-level population, per pass and slab
    beta: Vec<Vec<f64>>,
    /// Pulselet fluence, per pass and time step
    fluence: Vec<Vec<f64>>,
}

impl AmplifierModel {
    pub fn new(params: AmplifierParams) -> Self {
        let photon_energy = H * C / (WAVELENGTH_NM * 1e-9);
        let doping = DOPING_INTEGRATED / CRYSTAL_LENGTH;
        let slabs = params.slabs.max(1);
        let steps = params.time_steps.max(1);

        let beta_mean = STORED_FLUENCE / (doping * photon_energy * CRYSTAL_LENGTH) - LOWER_LEVEL_FRACTION;
        let mut beta = vec![vec![0.0; slabs]; params.passes + 1];
        beta[0] = vec![beta_mean; slabs];

        let seed_fluence = params.input_energy / CRYSTAL_WIDTH.powi(2);
        let fluence = vec![vec![seed_fluence / steps as f64; steps]; params.passes + 1];

        Self {
            params: AmplifierParams {
                slabs,
                time_steps: steps,
                ..params
            },
            photon_energy,
            doping,
            slab_length: CRYSTAL_LENGTH / slabs as f64,
            beta,
            fluence,
        }
    }

    /// Parameters after sanitizing slabs and time steps
    pub fn params(&self) -> &AmplifierParams {
        &self.params
    }

    /// Set the seed temporal profile
    ///
    /// The shape is normalized and resampled onto the model's time steps;
    /// the seed energy is kept.
    pub fn set_input_shape(&mut self, shape: &[f64]) {
        let steps = self.params.time_steps;
        let resampled = TraceProcessor::resample(shape, steps).unwrap_or_else(|_| vec![0.0; steps]);
        let input = TraceProcessor::normalize(&resampled);
        let scale = self.params.input_energy / CRYSTAL_WIDTH.powi(2) / steps as f64;
        for pass in self.fluence.iter_mut() {
            for (f, v) in pass.iter_mut().zip(&input) {
                *f = v * scale;
            }
        }
    }

    /// Propagate the seed through every pass
    pub fn simulate(&mut self) {
        let coupling = SIGMA_EMISSION * self.doping * self.slab_length;
        for pass in 1..=self.params.passes {
            self.beta[pass] = self.beta[pass - 1].clone();
            self.fluence[pass] = self.fluence[pass - 1].clone();

            for t in 0..self.params.time_steps {
                for z in 0..self.params.slabs {
                    let mut before = self.fluence[pass][t];
                    if z > 0 {
                        before *= 1.0 - SLAB_LOSS;
                    }
                    let b = self.beta[pass][z];
                    let after = before * ((b - LOWER_LEVEL_FRACTION * (1.0 - b)) * coupling).exp();
                    self.fluence[pass][t] = after;

                    let emitted = (after - before) / (self.photon_energy * self.slab_length);
                    self.beta[pass][z] = b - emitted / self.doping;
                }
                self.fluence[pass][t] *= 1.0 - END_LOSS;
            }
        }
    }

    /// Normalized output profile after the last pass
    pub fn output_shape(&self) -> Vec<f64> {
        TraceProcessor::normalize(&self.fluence[self.params.passes])
    }

    /// Output energy after the last pass, J
    pub fn output_energy(&self) -> f64 {
        self.fluence[self.params.passes].iter().sum::<f64>() * CRYSTAL_WIDTH.powi(2)
    }
}

impl Default for AmplifierModel {
    fn default() -> Self {
        Self::new(AmplifierParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_amplifier_has_gain() {
        let mut model = AmplifierModel::default();
        let seed = model.params().input_energy;
        model.simulate();
        let out = model.output_energy();
        assert!(out > seed, "output {} J not above seed {} J", out, seed);
        assert!(out.is_finite());
    }

    #[test]
    fn test_saturation_favours_leading_edge() {
        let mut model = AmplifierModel::default();
        model.set_input_shape(&[1.0; 82]);
        model.simulate();
        let shape = model.output_shape();
        assert_eq!(shape.len(), 100);
        assert_eq!(shape[0], 1.0, "leading edge should be the peak");
        assert!(shape[99] < shape[0]);
        assert!(shape.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_zero_passes_is_identity() {
        let mut model = AmplifierModel::new(AmplifierParams {
            passes: 0,
            ..AmplifierParams::default()
        });
        model.set_input_shape(&[0.5, 1.0]);
        model.simulate();
        let shape = model.output_shape();
        assert_eq!(shape.len(), 100);
        assert_relative_eq!(shape[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(shape[99], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_simulate_is_repeatable() {
        let mut model = AmplifierModel::default();
        model.simulate();
        let first = model.output_energy();
        model.simulate();
        assert_eq!(model.output_energy(), first);
    }
}
