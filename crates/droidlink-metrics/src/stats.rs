//! Outlier statistics and the Monte Carlo false-positive estimate.
//!
//! A metric regresses when more than half of its "after" samples lie
//! further than `threshold` population standard deviations from the
//! "before" mean. With a zero standard deviation every sample that differs
//! from the mean at all is an outlier.

use std::f64::consts::PI;

use rand::Rng;

/// Default outlier distance, in standard deviations.
pub const STD_DEV_THRESHOLD: f64 = 2.0;

/// Default number of Monte Carlo trials.
pub const SAMPLES: usize = 100_000;

/// Arithmetic mean; 0.0 for no samples.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Population standard deviation (divides by n); 0.0 for no samples.
pub fn population_stddev(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let m = mean(samples);
    let variance = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

/// Counts samples further than `stddev * threshold` from `center`.
pub fn count_outliers(center: f64, stddev: f64, samples: &[f64], threshold: f64) -> usize {
    let limit = stddev * threshold;
    samples.iter().filter(|x| (*x - center).abs() > limit).count()
}

/// `outliers > sample_count / 2`, with integer division.
pub fn is_regression(outliers: usize, sample_count: usize) -> bool {
    outliers > sample_count / 2
}

/// Applies the regression rule to raw before/after samples.
pub fn detect(before: &[f64], after: &[f64], threshold: f64) -> bool {
    let outliers = count_outliers(mean(before), population_stddev(before), after, threshold);
    is_regression(outliers, after.len())
}

/// Estimates how often the rule fires on samples that did not change.
///
/// Each trial draws `before_len` and `after_len` values from
/// N(`before_mean`, `before_stddev`) and applies [`detect`]. A flat baseline
/// (zero or non-finite spread) only ever yields the mean, so nothing can
/// leave the band and the estimate is 0.0.
pub fn false_positive_probability<R: Rng + ?Sized>(
    before_mean: f64,
    before_stddev: f64,
    before_len: usize,
    after_len: usize,
    threshold: f64,
    samples: usize,
    rng: &mut R,
) -> f64 {
    if samples == 0 || before_len == 0 {
        return 0.0;
    }
    if !before_stddev.is_finite() || before_stddev <= 0.0 {
        return 0.0;
    }

    let draw = |rng: &mut R| before_mean + before_stddev * standard_normal(rng);
    let mut before = vec![0.0; before_len];
    let mut after = vec![0.0; after_len];
    let mut hits = 0usize;

    for _ in 0..samples {
        before.iter_mut().for_each(|x| *x = draw(rng));
        after.iter_mut().for_each(|x| *x = draw(rng));
        if detect(&before, &after, threshold) {
            hits += 1;
        }
    }

    hits as f64 / samples as f64
}

/// One N(0, 1) draw (Box-Muller).
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // 1 - [0, 1) keeps the logarithm finite.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
