//! Correction strategies
//!
//! A strategy maps `(target, current, gain)` to a per-sample multiplicative
//! factor. A factor of 1 leaves the AWG sample unchanged.

use super::PluginError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name under which [`DefaultCorrection`] is registered
pub const DEFAULT_STRATEGY: &str = "default";

/// Computes the correction factor for the next iteration
///
/// Implementations must be pure and return one factor per target sample.
pub trait CorrectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn compute(&self, target: &[f64], current: &[f64], gain: f64) -> Result<Vec<f64>, PluginError>;
}

/// Ratio correction damped by the gain
///
/// `factor = (target / current - 1) * gain + 1`, with any non-finite ratio
/// replaced by the neutral factor 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCorrection;

impl DefaultCorrection {
    /// `(target / current - 1) * gain + 1`; a non-finite ratio gives the neutral 1
    pub fn factor(target: &[f64], current: &[f64], gain: f64) -> Vec<f64> {
        target
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let ratio = current.get(i).map(|&c| t / c).unwrap_or(1.0);
                let ratio = if ratio.is_finite() { ratio } else { 1.0 };
                (ratio - 1.0) * gain + 1.0
            })
            .collect()
    }
}

impl CorrectionStrategy for DefaultCorrection {
    fn name(&self) -> &str {
        DEFAULT_STRATEGY
    }

    fn compute(&self, target: &[f64], current: &[f64], gain: f64) -> Result<Vec<f64>, PluginError> {
        Ok(Self::factor(target, current, gain))
    }
}

type StrategyFn = dyn Fn(&[f64], &[f64], f64) -> Result<Vec<f64>, PluginError> + Send + Sync;

/// Adapts a closure to [`CorrectionStrategy`]
pub struct FnStrategy {
    name: String,
    func: Box<StrategyFn>,
}

impl FnStrategy {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[f64], &[f64], f64) -> Result<Vec<f64>, PluginError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl std::fmt::Debug for FnStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStrategy").field("name", &self.name).finish()
    }
}

impl CorrectionStrategy for FnStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, target: &[f64], current: &[f64], gain: f64) -> Result<Vec<f64>, PluginError> {
        (self.func)(target, current, gain)
    }
}

/// Named strategies available to a session
///
/// `default` is always registered.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn CorrectionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            strategies: BTreeMap::new(),
        };
        registry.register(Arc::new(DefaultCorrection));
        registry
    }

    /// Register a strategy under its own name, replacing any previous entry
    pub fn register(&mut self, strategy: Arc<dyn CorrectionStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    /// Look up a strategy by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn CorrectionStrategy>, PluginError> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::UnknownStrategy(name.to_string()))
    }

    /// Look up `name`, falling back to the default strategy
    ///
    /// The lookup error is returned alongside the fallback so the caller can
    /// report it.
    pub fn resolve(&self, name: &str) -> (Arc<dyn CorrectionStrategy>, Option<PluginError>) {
        match self.get(name) {
            Ok(strategy) => (strategy, None),
            Err(e) => {
                tracing::warn!(requested = name, error = %e, "Falling back to default correction");
                (Arc::new(DefaultCorrection), Some(e))
            }
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_neutral_when_target_equals_current() {
        let shape = [0.2, 0.7, 1.0, 0.4];
        for gain in [0.1, 0.5, 1.0] {
            let factor = DefaultCorrection::factor(&shape, &shape, gain);
            assert!(factor.iter().all(|&f| f == 1.0), "gain {}: {:?}", gain, factor);
        }
    }

    #[test]
    fn test_gain_damps_ratio() {
        let factor = DefaultCorrection::factor(&[1.0; 4], &[0.5; 4], 0.5);
        for f in factor {
            assert_relative_eq!(f, 1.5);
        }
    }

    #[test]
    fn test_division_by_zero_is_neutral() {
        let factor = DefaultCorrection::factor(&[1.0, 0.0, 1.0], &[0.0, 0.0, 0.0], 0.7);
        assert_eq!(factor, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_registry_has_default() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.names(), vec!["default"]);
        assert_eq!(registry.get("default").unwrap().name(), "default");
    }

    #[test]
    fn test_registry_unknown_falls_back() {
        let registry = StrategyRegistry::new();
        let (strategy, err) = registry.resolve("aggressive");
        assert_eq!(strategy.name(), "default");
        assert_eq!(err, Some(PluginError::UnknownStrategy("aggressive".into())));
    }

    #[test]
    fn test_registered_closure_strategy() {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(FnStrategy::new("double", |target, _current, _gain| {
            Ok(vec![2.0; target.len()])
        })));

        let (strategy, err) = registry.resolve("double");
        assert!(err.is_none());
        assert_eq!(strategy.compute(&[1.0, 1.0], &[1.0, 1.0], 0.5).unwrap(), vec![2.0, 2.0]);
    }
}
