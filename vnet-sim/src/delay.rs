//! Transit delay distribution.
//!
//! A `DelayModel` is an empirical inverse CDF of a normal distribution
//! clipped to four standard deviations around the mean. The table is built
//! once; sampling is a single uniform index lookup.

use std::f64::consts::PI;

use crate::deterministic::DeterministicRng;

/// Point of a piecewise-linear function: `(x, y)`.
pub type Point = (f64, f64);

/// Latency distribution sampled for every packet and control message.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayModel {
    mean: u32,
    stddev: u32,
    table: Vec<Point>,
}

impl Default for DelayModel {
    fn default() -> Self {
        Self::build(0, 0, vnet_core::config::DEFAULT_DELAY_SAMPLES)
    }
}

impl DelayModel {
    /// Builds the inverse-CDF table for `Normal(mean, stddev)`.
    ///
    /// A zero `stddev` yields a table where every entry is `mean`. Fewer
    /// than two samples are raised to two.
    pub fn build(mean: u32, stddev: u32, samples: u32) -> Self {
        let samples = samples.max(2);
        let density = if stddev == 0 {
            vec![(f64::from(mean), 1.0)]
        } else {
            let mean_f = f64::from(mean);
            let spread = 4.0 * f64::from(stddev);
            let start = if mean_f >= spread { mean_f - spread } else { 0.0 };
            let end = mean_f + spread;

            (0..samples)
                .map(|i| {
                    let x = start + (end - start) * f64::from(i) / f64::from(samples - 1);
                    (x, normal(x, mean_f, f64::from(stddev)))
                })
                .collect()
        };

        Self {
            mean,
            stddev,
            table: resample(&invert(accumulate(density)), 0.0, 1.0, samples),
        }
    }

    /// Draws a transit delay in whole milliseconds.
    pub fn sample(&self, rng: &mut DeterministicRng) -> u32 {
        if self.table.is_empty() {
            return self.mean;
        }
        let index = rng.random_range(0, self.table.len() as u64) as usize;
        // Delays are non-negative, truncation matches whole-millisecond timers
        self.table[index].1 as u32
    }

    /// Mean the model was built with.
    pub fn mean(&self) -> u32 {
        self.mean
    }

    /// Standard deviation the model was built with.
    pub fn stddev(&self) -> u32 {
        self.stddev
    }

    /// The resampled inverse CDF: cumulative probability to delay.
    pub fn table(&self) -> &[Point] {
        &self.table
    }
}

fn normal(x: f64, mean: f64, stddev: f64) -> f64 {
    let a = (x - mean) * (x - mean) / (2.0 * stddev * stddev);
    (-a).exp() / (stddev * (2.0 * PI).sqrt())
}

/// Integrates `f` with the trapezoid rule, replacing each `y` with the
/// running integral up to that point.
pub fn accumulate(mut f: Vec<Point>) -> Vec<Point> {
    let mut total = 0.0;
    for i in 0..f.len() {
        let step = match f.get(i + 1) {
            Some(next) => (next.0 - f[i].0) * (next.1 + f[i].1) / 2.0,
            None => 0.0,
        };
        f[i].1 = total;
        total += step;
    }
    f
}

/// Swaps domain and range, then re-sorts by the new domain.
pub fn invert(mut f: Vec<Point>) -> Vec<Point> {
    for point in &mut f {
        *point = (point.1, point.0);
    }
    f.sort_by(|a, b| a.0.total_cmp(&b.0));
    f
}

/// Evaluates `f` at `samples` evenly spaced points over `[x1, x2]`.
pub fn resample(f: &[Point], x1: f64, x2: f64, samples: u32) -> Vec<Point> {
    let samples = samples.max(2);
    (0..samples)
        .map(|i| {
            let x = x1 + (x2 - x1) * f64::from(i) / f64::from(samples - 1);
            (x, evaluate(f, x))
        })
        .collect()
}

/// Linear interpolation of a table sorted by `x`, clamped to the first and
/// last values outside the domain. An empty table evaluates to 0.
pub fn evaluate(f: &[Point], x: f64) -> f64 {
    let (Some(first), Some(last)) = (f.first(), f.last()) else {
        return 0.0;
    };

    let index = f.partition_point(|point| point.0 < x);
    if index == 0 {
        return first.1;
    }
    if index == f.len() {
        return last.1;
    }

    let (x2, y2) = f[index];
    if x2 == x {
        return y2;
    }
    let (x1, y1) = f[index - 1];
    y1 + (y2 - y1) * (x - x1) / (x2 - x1)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn mean_and_stddev(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
        let count = values.clone().count() as f64;
        let mean = values.clone().sum::<f64>() / count;
        let variance = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;
        (mean, variance.sqrt())
    }

    #[test]
    fn test_creates_standard_distribution() {
        for mean in [10u32, 100, 333, 1000] {
            for factor in [0.25, 0.1, 0.01] {
                let stddev = (factor * f64::from(mean)) as u32;
                let model = DelayModel::build(mean, stddev, 1000);

                assert_eq!(model.table().len(), 1000);
                let (sample_mean, sample_stddev) =
                    mean_and_stddev(model.table().iter().map(|point| point.1));

                assert!(
                    (sample_mean - f64::from(mean)).abs() <= 0.1 * f64::from(mean),
                    "M={mean} SD={stddev}: mean {sample_mean}"
                );
                assert!(
                    (sample_stddev - f64::from(stddev)).abs() <= 0.1 * f64::from(stddev),
                    "M={mean} SD={stddev}: stddev {sample_stddev}"
                );
            }
        }
    }

    #[test]
    fn test_evaluate_interpolates_and_clamps() {
        let f = vec![(0.0, 10.0), (1.0, 20.0), (3.0, 40.0)];

        assert_eq!(evaluate(&f, -5.0), 10.0);
        assert_eq!(evaluate(&f, 0.0), 10.0);
        assert_eq!(evaluate(&f, 0.5), 15.0);
        assert_eq!(evaluate(&f, 1.0), 20.0);
        assert_eq!(evaluate(&f, 2.0), 30.0);
        assert_eq!(evaluate(&f, 10.0), 40.0);
        assert_eq!(evaluate(&[], 1.0), 0.0);
    }

    #[test]
    fn test_accumulate_uses_trapezoids() {
        let f = accumulate(vec![(0.0, 1.0), (2.0, 1.0), (3.0, 3.0)]);
        assert_eq!(f, vec![(0.0, 0.0), (2.0, 2.0), (3.0, 4.0)]);
    }

    #[test]
    fn test_invert_swaps_and_sorts() {
        let f = invert(vec![(1.0, 0.5), (2.0, 0.1), (3.0, 0.9)]);
        assert_eq!(f, vec![(0.1, 2.0), (0.5, 1.0), (0.9, 3.0)]);
    }

    #[test]
    fn test_low_mean_clips_start_at_zero() {
        let model = DelayModel::build(50, 50, 1000);
        assert!(model.table().iter().all(|point| point.1 >= 0.0));
        assert!(model.table().iter().all(|point| point.1 <= 250.0));
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let model = DelayModel::build(100, 20, 1000);
        let mut rng1 = DeterministicRng::from_seed(3);
        let mut rng2 = DeterministicRng::from_seed(3);

        let a: Vec<u32> = (0..50).map(|_| model.sample(&mut rng1)).collect();
        let b: Vec<u32> = (0..50).map(|_| model.sample(&mut rng2)).collect();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn zero_stddev_always_samples_mean(mean in 0u32..100_000, samples in 2u32..2000, seed: u64) {
            let model = DelayModel::build(mean, 0, samples);
            let mut rng = DeterministicRng::from_seed(seed);
            for _ in 0..32 {
                prop_assert_eq!(model.sample(&mut rng), mean);
            }
        }

        #[test]
        fn inverse_cdf_is_monotonic(mean in 1u32..5000, stddev in 1u32..1000) {
            let model = DelayModel::build(mean, stddev, 500);
            let table = model.table();
            for pair in table.windows(2) {
                prop_assert!(pair[0].0 <= pair[1].0);
                prop_assert!(pair[0].1 <= pair[1].1 + 1e-9);
            }
        }
    }
}
