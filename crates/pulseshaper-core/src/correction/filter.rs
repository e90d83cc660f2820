//! Smoothing filters applied to the next AWG waveform before it is written
//!
//! Filters must return a buffer of the same length as their input.

use super::PluginError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name under which [`IdentityFilter`] is registered
pub const NO_FILTER: &str = "none";

pub trait SmoothingFilter: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, data: &[f64]) -> Result<Vec<f64>, PluginError>;
}

/// Pass-through filter
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

impl SmoothingFilter for IdentityFilter {
    fn name(&self) -> &str {
        NO_FILTER
    }

    fn apply(&self, data: &[f64]) -> Result<Vec<f64>, PluginError> {
        Ok(data.to_vec())
    }
}

/// Gaussian smoothing with reflected edges
///
/// The kernel is truncated at `4 * sigma` samples either side.
#[derive(Debug, Clone)]
pub struct GaussianFilter {
    kernel: Vec<f64>,
}

impl GaussianFilter {
    pub fn new(sigma: f64) -> Self {
        let sigma = sigma.max(f64::EPSILON);
        let radius = (4.0 * sigma + 0.5) as isize;
        let mut kernel: Vec<f64> = (-radius..=radius)
            .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
            .collect();
        let sum: f64 = kernel.iter().sum();
        for w in &mut kernel {
            *w /= sum;
        }
        Self { kernel }
    }

    fn radius(&self) -> isize {
        (self.kernel.len() / 2) as isize
    }
}

impl Default for GaussianFilter {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Map an out-of-range index into `0..n` by mirroring at the edges
/// (`d c b a | a b c d | d c b a`)
fn reflect_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

impl SmoothingFilter for GaussianFilter {
    fn name(&self) -> &str {
        "gaussian"
    }

    fn apply(&self, data: &[f64]) -> Result<Vec<f64>, PluginError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let r = self.radius();
        let n = data.len();
        let out = (0..n as isize)
            .map(|i| {
                self.kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * data[reflect_index(i + k as isize - r, n)])
                    .sum()
            })
            .collect();
        Ok(out)
    }
}

/// Running median over an odd-sized window, zero-padded at the edges
#[derive(Debug, Clone, Copy)]
pub struct MedianFilter {
    kernel: usize,
}

impl MedianFilter {
    /// Even kernel sizes are rounded up to the next odd size
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel: kernel.max(1) | 1,
        }
    }
}

impl Default for MedianFilter {
    fn default() -> Self {
        Self::new(11)
    }
}

impl SmoothingFilter for MedianFilter {
    fn name(&self) -> &str {
        "median"
    }

    fn apply(&self, data: &[f64]) -> Result<Vec<f64>, PluginError> {
        let half = (self.kernel / 2) as isize;
        let n = data.len() as isize;
        let mut window = Vec::with_capacity(self.kernel);
        let out = (0..n)
            .map(|i| {
                window.clear();
                window.extend((i - half..=i + half).map(|j| {
                    if (0..n).contains(&j) {
                        data[j as usize]
                    } else {
                        0.0
                    }
                }));
                window.sort_by(f64::total_cmp);
                window[window.len() / 2]
            })
            .collect();
        Ok(out)
    }
}

/// Named filters available to a session
///
/// `none`, `gaussian` (sigma 1) and `median` (kernel 11) are registered by
/// default.
pub struct FilterRegistry {
    filters: BTreeMap<String, Arc<dyn SmoothingFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            filters: BTreeMap::new(),
        };
        registry.register(Arc::new(IdentityFilter));
        registry.register(Arc::new(GaussianFilter::default()));
        registry.register(Arc::new(MedianFilter::default()));
        registry
    }

    /// Add or replace a filter under its own name
    pub fn register(&mut self, filter: Arc<dyn SmoothingFilter>) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    /// Look up a filter by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn SmoothingFilter>, PluginError> {
        self.filters
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::UnknownFilter(name.to_string()))
    }

    /// Look up `name`, falling back to the identity filter
    pub fn resolve(&self, name: &str) -> (Arc<dyn SmoothingFilter>, Option<PluginError>) {
        match self.get(name) {
            Ok(filter) => (filter, None),
            Err(e) => {
                tracing::warn!(requested = name, error = %e, "Smoothing disabled");
                (Arc::new(IdentityFilter), Some(e))
            }
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.filters.keys().map(String::as_str).collect()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
    }

    #[test]
    fn test_gaussian_kernel_sums_to_one() {
        let filter = GaussianFilter::new(1.0);
        assert_eq!(filter.kernel.len(), 9);
        assert_abs_diff_eq!(filter.kernel.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_preserves_constant() {
        let out = GaussianFilter::default().apply(&[0.6; 12]).unwrap();
        for v in out {
            assert_abs_diff_eq!(v, 0.6, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gaussian_smooths_spike() {
        let mut data = vec![0.0; 21];
        data[10] = 1.0;
        let out = GaussianFilter::default().apply(&data).unwrap();
        assert!(out[10] < 1.0);
        assert!(out[9] > 0.0 && out[11] > 0.0);
        assert_abs_diff_eq!(out.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_median_removes_outlier() {
        let mut data = vec![1.0; 15];
        data[7] = 50.0;
        let out = MedianFilter::new(3).apply(&data).unwrap();
        assert_eq!(out[7], 1.0);
        // a single padded zero is outvoted at the edge
        assert_eq!(out[0], 1.0);
        assert_eq!(out.len(), data.len());
    }

    #[test]
    fn test_median_even_kernel_rounded_up() {
        assert_eq!(MedianFilter::new(4).kernel, 5);
    }

    #[test]
    fn test_registry_defaults() {
        let registry = FilterRegistry::new();
        assert_eq!(registry.names(), vec!["gaussian", "median", "none"]);
        let (filter, err) = registry.resolve("butterworth");
        assert_eq!(filter.name(), "none");
        assert!(matches!(err, Some(PluginError::UnknownFilter(_))));
    }
}
