//! Reference pulse shapes

/// Flat-top pulse of `n` points at full amplitude
pub fn square(n: usize) -> Vec<f64> {
    vec![1.0; n]
}

/// Linear ramp of `n` points from `start` to `stop` inclusive
pub fn ramp(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}
