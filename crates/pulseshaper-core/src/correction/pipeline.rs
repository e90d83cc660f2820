//! Per-iteration numeric pipeline
//!
//! Turns the target, the AWG's current normalized output and the latest
//! feedback measurement into the next waveform to apply:
//!
//! 1. correction factor from the strategy
//! 2. global clamp to `1 ± max_percent_change / 100`
//! 3. `next = awg_now * factor`
//! 4. first iteration only: zero-shift where the target is non-zero but the
//!    measurement is at noise level
//! 5. `next = 0` wherever the target is zero
//! 6. optional smoothing filter (zero-target samples are re-forced afterwards)
//! 7. normalize by the maximum
//!
//! Strategy and filter failures are recovered here: a failing strategy is
//! replaced by [`DefaultCorrection`] and a failing filter by the identity
//! for the rest of the session. Non-finite plugin output counts as a
//! failure, and non-finite factors are neutral (1) for the iteration that
//! produced them. Each failure is reported once through
//! [`IterationPlan::plugin_errors`].

use super::filter::SmoothingFilter;
use super::strategy::{CorrectionStrategy, DefaultCorrection};
use super::PluginError;
use crate::trace::{TraceError, TraceProcessor};
use std::sync::Arc;

/// Value returned by [`rms_error`] when the error is undefined
///
/// Never compares below any tolerance, so an undefined error can't be
/// mistaken for convergence.
pub const RMS_UNDEFINED: f64 = f64::INFINITY;

/// Limits applied while building the next waveform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLimits {
    /// Largest allowed change of any factor, in percent
    pub max_percent_change: f64,
    /// Measurement level, in percent of full scale, treated as noise
    pub noise_threshold_percent: f64,
    /// Offset seeded into noise-level samples on the first iteration
    pub zero_shift_offset: f64,
}

/// Inputs for one pass of the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub target: &'a [f64],
    /// Current AWG output, normalized to full scale
    pub awg_now: &'a [f64],
    /// Latest normalized feedback measurement
    pub current_output: &'a [f64],
    pub gain: f64,
    pub iteration: u32,
}

/// Result of one pass of the pipeline
#[derive(Debug, Clone, Default)]
pub struct IterationPlan {
    /// Clamped correction factor
    pub factor: Vec<f64>,
    /// Normalized waveform to apply
    pub next: Vec<f64>,
    /// `1 / mean(next)`
    pub peak_power: f64,
    /// Plugin failures recovered while building this plan
    pub plugin_errors: Vec<PluginError>,
}

/// Owns the session's strategy and filter and runs the pipeline
pub struct CorrectionEngine {
    strategy: Arc<dyn CorrectionStrategy>,
    filter: Option<Arc<dyn SmoothingFilter>>,
    limits: StepLimits,
}

impl CorrectionEngine {
    pub fn new(
        strategy: Arc<dyn CorrectionStrategy>,
        filter: Option<Arc<dyn SmoothingFilter>>,
        limits: StepLimits,
    ) -> Self {
        Self {
            strategy,
            filter,
            limits,
        }
    }

    /// Name of the active strategy
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Name of the active filter, `None` once disabled or if never set
    pub fn filter_name(&self) -> Option<&str> {
        self.filter.as_deref().map(|f| f.name())
    }

    /// Clamp and zero-shift settings
    pub fn limits(&self) -> StepLimits {
        self.limits
    }

    /// Build the next waveform
    pub fn plan(&mut self, inputs: PlanInputs<'_>) -> Result<IterationPlan, TraceError> {
        let n = inputs.target.len();
        for len in [inputs.awg_now.len(), inputs.current_output.len()] {
            if len != n {
                return Err(TraceError::LengthMismatch {
                    expected: n,
                    actual: len,
                });
            }
        }

        let mut plugin_errors = Vec::new();
        let mut factor = self.compute_factor(&inputs, &mut plugin_errors);
        clamp_factor(&mut factor, self.limits.max_percent_change);

        let mut next: Vec<f64> = inputs
            .awg_now
            .iter()
            .zip(&factor)
            .map(|(a, f)| a * f)
            .collect();

        if inputs.iteration == 0 {
            let noise = self.limits.noise_threshold_percent / 100.0;
            for ((v, &t), &c) in next.iter_mut().zip(inputs.target).zip(inputs.current_output) {
                if t != 0.0 && c <= noise {
                    *v += self.limits.zero_shift_offset;
                }
            }
        }

        zero_where_target_zero(&mut next, inputs.target);

        if let Some(filter) = self.filter.clone() {
            match checked_filter(filter.as_ref(), &next) {
                Ok(filtered) => {
                    next = filtered;
                    zero_where_target_zero(&mut next, inputs.target);
                }
                Err(e) => {
                    tracing::warn!(filter = filter.name(), error = %e, "Smoothing filter disabled for this session");
                    self.filter = None;
                    plugin_errors.push(e);
                }
            }
        }

        let next = TraceProcessor::normalize(&next);
        let peak_power = peak_power(&next);

        Ok(IterationPlan {
            factor,
            next,
            peak_power,
            plugin_errors,
        })
    }

    fn compute_factor(&mut self, inputs: &PlanInputs<'_>, errors: &mut Vec<PluginError>) -> Vec<f64> {
        let expected = inputs.target.len();
        let result = self
            .strategy
            .compute(inputs.target, inputs.current_output, inputs.gain)
            .and_then(|factor| {
                if factor.len() == expected {
                    Ok(factor)
                } else {
                    Err(PluginError::BadLength {
                        plugin: self.strategy.name().to_string(),
                        expected,
                        actual: factor.len(),
                    })
                }
            });

        match result {
            Ok(mut factor) => {
                let bad = neutralize_non_finite(&mut factor);
                if bad > 0 {
                    let e = PluginError::Failed {
                        plugin: self.strategy.name().to_string(),
                        reason: format!("{} non-finite factors", bad),
                    };
                    tracing::warn!(strategy = self.strategy.name(), error = %e, "Falling back to default correction");
                    self.strategy = Arc::new(DefaultCorrection);
                    errors.push(e);
                }
                factor
            }
            Err(e) => {
                tracing::warn!(strategy = self.strategy.name(), error = %e, "Falling back to default correction");
                self.strategy = Arc::new(DefaultCorrection);
                errors.push(e);
                DefaultCorrection::factor(inputs.target, inputs.current_output, inputs.gain)
            }
        }
    }
}

fn checked_filter(filter: &dyn SmoothingFilter, data: &[f64]) -> Result<Vec<f64>, PluginError> {
    let out = filter.apply(data)?;
    if out.len() != data.len() {
        return Err(PluginError::BadLength {
            plugin: filter.name().to_string(),
            expected: data.len(),
            actual: out.len(),
        });
    }
    let bad = out.iter().filter(|v| !v.is_finite()).count();
    if bad > 0 {
        return Err(PluginError::Failed {
            plugin: filter.name().to_string(),
            reason: format!("{} non-finite samples", bad),
        });
    }
    Ok(out)
}

/// Set every non-finite factor to the neutral 1 and return the count
fn neutralize_non_finite(factor: &mut [f64]) -> usize {
    let mut count = 0;
    for f in factor.iter_mut().filter(|f| !f.is_finite()) {
        *f = 1.0;
        count += 1;
    }
    count
}

fn zero_where_target_zero(next: &mut [f64], target: &[f64]) {
    for (v, &t) in next.iter_mut().zip(target) {
        if t == 0.0 {
            *v = 0.0;
        }
    }
}

/// Clamp every factor into `[1 - mpc/100, 1 + mpc/100]`
pub fn clamp_factor(factor: &mut [f64], max_percent_change: f64) {
    let limit = (max_percent_change / 100.0).abs();
    for f in factor {
        *f = f.clamp(1.0 - limit, 1.0 + limit);
    }
}

/// Peak power estimate `1 / mean(next)`
///
/// An empty, all-zero or non-finite waveform has no meaningful estimate and
/// is reported as infinite so it always trips the peak power limit.
pub fn peak_power(next_normalized: &[f64]) -> f64 {
    if next_normalized.is_empty() {
        return f64::INFINITY;
    }
    let mean = next_normalized.iter().sum::<f64>() / next_normalized.len() as f64;
    let power = 1.0 / mean;
    if power.is_finite() && power > 0.0 {
        power
    } else {
        f64::INFINITY
    }
}

/// `sqrt(mean((target - current)^2))`, or [`RMS_UNDEFINED`]
pub fn rms_error(target: &[f64], current: &[f64]) -> f64 {
    if target.is_empty() || target.len() != current.len() {
        return RMS_UNDEFINED;
    }
    let sum: f64 = target
        .iter()
        .zip(current)
        .map(|(t, c)| (t - c).powi(2))
        .sum();
    let rms = (sum / target.len() as f64).sqrt();
    if rms.is_finite() {
        rms
    } else {
        RMS_UNDEFINED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::filter::{GaussianFilter, IdentityFilter};
    use crate::correction::strategy::FnStrategy;
    use approx::assert_relative_eq;

    fn limits(mpc: f64) -> StepLimits {
        StepLimits {
            max_percent_change: mpc,
            noise_threshold_percent: 5.0,
            zero_shift_offset: 0.1,
        }
    }

    fn engine(mpc: f64) -> CorrectionEngine {
        CorrectionEngine::new(Arc::new(DefaultCorrection), None, limits(mpc))
    }

    #[test]
    fn test_half_gain_scenario() {
        let mut engine = engine(100.0);
        let plan = engine
            .plan(PlanInputs {
                target: &[1.0; 4],
                awg_now: &[0.5; 4],
                current_output: &[0.5; 4],
                gain: 0.5,
                iteration: 3,
            })
            .unwrap();
        for f in &plan.factor {
            assert_relative_eq!(*f, 1.5);
        }
        // 0.5 * 1.5 = 0.75 before the final normalization
        for v in &plan.next {
            assert_relative_eq!(*v, 1.0);
        }
        assert_relative_eq!(plan.peak_power, 1.0);
    }

    #[test]
    fn test_unnormalized_next_matches_scenario() {
        let mut factor = DefaultCorrection::factor(&[1.0; 4], &[0.5; 4], 0.5);
        clamp_factor(&mut factor, 100.0);
        let next: Vec<f64> = [0.5; 4].iter().zip(&factor).map(|(a, f)| a * f).collect();
        for v in next {
            assert_relative_eq!(v, 0.75);
        }
    }

    #[test]
    fn test_zero_current_and_zero_target() {
        let mut engine = engine(100.0);
        let plan = engine
            .plan(PlanInputs {
                target: &[1.0, 0.0, 1.0],
                awg_now: &[0.4, 0.4, 0.4],
                current_output: &[0.0, 0.0, 0.0],
                gain: 0.5,
                iteration: 2,
            })
            .unwrap();
        assert_eq!(plan.factor, vec![1.0, 1.0, 1.0]);
        assert_eq!(plan.next[1], 0.0);
        assert_relative_eq!(plan.next[0], 1.0);
        assert_relative_eq!(plan.next[2], 1.0);
    }

    #[test]
    fn test_clamp_containment() {
        for mpc in [1.0, 5.0, 20.0, 100.0] {
            let mut factor = vec![-3.0, 0.0, 0.9, 1.0, 1.04, 7.5, f64::MAX];
            clamp_factor(&mut factor, mpc);
            for f in factor {
                assert!(f >= 1.0 - mpc / 100.0 && f <= 1.0 + mpc / 100.0, "{} outside {}%", f, mpc);
            }
        }
    }

    #[test]
    fn test_zero_shift_only_on_first_iteration() {
        let inputs = |iteration| PlanInputs {
            target: &[1.0, 1.0],
            awg_now: &[0.0, 0.5],
            current_output: &[0.0, 0.5],
            gain: 1.0,
            iteration,
        };

        let plan = engine(10.0).plan(inputs(0)).unwrap();
        // sample 0 is seeded with 0.1, sample 1 becomes 0.55
        assert_relative_eq!(plan.next[0], 0.1 / 0.55);
        assert_relative_eq!(plan.next[1], 1.0);

        let plan = engine(10.0).plan(inputs(1)).unwrap();
        assert_eq!(plan.next[0], 0.0);
    }

    #[test]
    fn test_zero_shift_respects_noise_threshold() {
        let plan = engine(10.0)
            .plan(PlanInputs {
                target: &[1.0, 1.0],
                awg_now: &[0.5, 0.5],
                current_output: &[0.04, 0.06],
                gain: 0.0,
                iteration: 0,
            })
            .unwrap();
        // 0.04 <= 5% is noise, 0.06 is a real response
        assert_relative_eq!(plan.next[0], 1.0);
        assert_relative_eq!(plan.next[1], 0.5 / 0.6);
    }

    #[test]
    fn test_zero_target_survives_filter() {
        let mut engine = CorrectionEngine::new(
            Arc::new(DefaultCorrection),
            Some(Arc::new(GaussianFilter::default())),
            limits(50.0),
        );
        let target = [0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        let plan = engine
            .plan(PlanInputs {
                target: &target,
                awg_now: &[0.5; 7],
                current_output: &[0.5; 7],
                gain: 0.5,
                iteration: 1,
            })
            .unwrap();
        for (v, t) in plan.next.iter().zip(&target) {
            if *t == 0.0 {
                assert_eq!(*v, 0.0);
            } else {
                assert!(*v > 0.0);
            }
        }
    }

    #[test]
    fn test_failing_strategy_falls_back_once() {
        let failing = FnStrategy::new("broken", |_, _, _| {
            Err(PluginError::Failed {
                plugin: "broken".into(),
                reason: "boom".into(),
            })
        });
        let mut engine = CorrectionEngine::new(Arc::new(failing), None, limits(100.0));
        let inputs = PlanInputs {
            target: &[1.0; 3],
            awg_now: &[0.5; 3],
            current_output: &[0.5; 3],
            gain: 0.5,
            iteration: 1,
        };

        let plan = engine.plan(inputs).unwrap();
        assert_eq!(plan.plugin_errors.len(), 1);
        assert_eq!(engine.strategy_name(), "default");
        assert_relative_eq!(plan.factor[0], 1.5);

        let plan = engine.plan(inputs).unwrap();
        assert!(plan.plugin_errors.is_empty());
    }

    #[test]
    fn test_wrong_length_strategy_is_rejected() {
        let short = FnStrategy::new("short", |_, _, _| Ok(vec![1.0]));
        let mut engine = CorrectionEngine::new(Arc::new(short), None, limits(100.0));
        let plan = engine
            .plan(PlanInputs {
                target: &[1.0; 3],
                awg_now: &[0.5; 3],
                current_output: &[1.0; 3],
                gain: 1.0,
                iteration: 1,
            })
            .unwrap();
        assert!(matches!(
            plan.plugin_errors[0],
            PluginError::BadLength { expected: 3, actual: 1, .. }
        ));
        assert_eq!(plan.factor.len(), 3);
    }

    struct BrokenFilter;

    impl SmoothingFilter for BrokenFilter {
        fn name(&self) -> &str {
            "broken"
        }

        fn apply(&self, _data: &[f64]) -> Result<Vec<f64>, PluginError> {
            Err(PluginError::Failed {
                plugin: "broken".into(),
                reason: "nan in kernel".into(),
            })
        }
    }

    #[test]
    fn test_failing_filter_is_disabled() {
        let mut engine = CorrectionEngine::new(
            Arc::new(DefaultCorrection),
            Some(Arc::new(BrokenFilter)),
            limits(100.0),
        );
        let inputs = PlanInputs {
            target: &[1.0; 3],
            awg_now: &[0.5; 3],
            current_output: &[0.5; 3],
            gain: 1.0,
            iteration: 1,
        };
        let plan = engine.plan(inputs).unwrap();
        assert_eq!(plan.plugin_errors.len(), 1);
        assert!(engine.filter_name().is_none());
        assert!(engine.plan(inputs).unwrap().plugin_errors.is_empty());
    }

    /// Returns the same output whatever it is given
    struct FixedFilter(Vec<f64>);

    impl SmoothingFilter for FixedFilter {
        fn name(&self) -> &str {
            "fixed"
        }

        fn apply(&self, _data: &[f64]) -> Result<Vec<f64>, PluginError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_wrong_length_filter_is_disabled() {
        let mut filtered = CorrectionEngine::new(
            Arc::new(DefaultCorrection),
            Some(Arc::new(FixedFilter(vec![1.0]))),
            limits(20.0),
        );
        let inputs = PlanInputs {
            target: &[1.0; 3],
            awg_now: &[0.3, 0.6, 0.9],
            current_output: &[0.4, 0.7, 1.0],
            gain: 0.5,
            iteration: 2,
        };

        let plan = filtered.plan(inputs).unwrap();
        assert!(matches!(
            plan.plugin_errors[..],
            [PluginError::BadLength { expected: 3, actual: 1, .. }]
        ));
        assert!(filtered.filter_name().is_none());
        // the unfiltered waveform is used instead
        assert_eq!(plan.next, engine(20.0).plan(inputs).unwrap().next);
    }

    #[test]
    fn test_non_finite_filter_output_is_disabled() {
        let mut engine = CorrectionEngine::new(
            Arc::new(DefaultCorrection),
            Some(Arc::new(FixedFilter(vec![f64::NAN, 1.0, f64::INFINITY]))),
            limits(20.0),
        );
        let plan = engine
            .plan(PlanInputs {
                target: &[1.0; 3],
                awg_now: &[0.5; 3],
                current_output: &[0.5; 3],
                gain: 0.5,
                iteration: 1,
            })
            .unwrap();

        assert!(matches!(plan.plugin_errors[..], [PluginError::Failed { .. }]));
        assert!(engine.filter_name().is_none());
        assert!(plan.next.iter().all(|v| v.is_finite()));
        assert!(plan.peak_power.is_finite());
    }

    #[test]
    fn test_non_finite_strategy_output_is_neutral() {
        let leaky = FnStrategy::new("leaky", |_, _, _| Ok(vec![1.2, f64::NAN, 1.0, f64::NEG_INFINITY]));
        let mut engine = CorrectionEngine::new(Arc::new(leaky), None, limits(20.0));
        let inputs = PlanInputs {
            target: &[1.0; 4],
            awg_now: &[0.5; 4],
            current_output: &[0.5; 4],
            gain: 0.5,
            iteration: 1,
        };

        let plan = engine.plan(inputs).unwrap();
        assert_relative_eq!(plan.factor[0], 1.2);
        assert_eq!(plan.factor[1..], [1.0, 1.0, 1.0]);
        assert!(plan.next.iter().all(|v| v.is_finite()));
        assert_relative_eq!(plan.next[1], 0.5 / 0.6);
        assert!(plan.peak_power.is_finite());
        assert!(matches!(
            &plan.plugin_errors[..],
            [PluginError::Failed { plugin, .. }] if plugin == "leaky"
        ));

        // replaced by the default for the rest of the session
        assert_eq!(engine.strategy_name(), "default");
        let plan = engine.plan(inputs).unwrap();
        assert!(plan.plugin_errors.is_empty());
        assert_relative_eq!(plan.factor[1], 1.2);
    }

    #[test]
    fn test_identity_filter_keeps_plan() {
        let mut with = CorrectionEngine::new(
            Arc::new(DefaultCorrection),
            Some(Arc::new(IdentityFilter)),
            limits(20.0),
        );
        let mut without = engine(20.0);
        let inputs = PlanInputs {
            target: &[0.2, 0.8, 1.0],
            awg_now: &[0.3, 0.6, 0.9],
            current_output: &[0.25, 0.7, 1.0],
            gain: 0.4,
            iteration: 4,
        };
        assert_eq!(with.plan(inputs).unwrap().next, without.plan(inputs).unwrap().next);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = engine(10.0)
            .plan(PlanInputs {
                target: &[1.0; 3],
                awg_now: &[1.0; 2],
                current_output: &[1.0; 3],
                gain: 1.0,
                iteration: 0,
            })
            .unwrap_err();
        assert!(matches!(err, TraceError::LengthMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_peak_power() {
        assert_relative_eq!(peak_power(&[1.0, 0.5, 0.5, 0.0]), 2.0);
        assert_eq!(peak_power(&[0.0, 0.0]), f64::INFINITY);
        assert_eq!(peak_power(&[]), f64::INFINITY);
    }

    #[test]
    fn test_rms_error() {
        assert_relative_eq!(rms_error(&[1.0, 1.0], &[0.0, 0.0]), 1.0);
        assert_eq!(rms_error(&[1.0, 1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(rms_error(&[1.0], &[1.0, 2.0]), RMS_UNDEFINED);
        assert_eq!(rms_error(&[], &[]), RMS_UNDEFINED);
    }
}
