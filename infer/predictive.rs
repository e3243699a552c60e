//! # Posterior-Predictive Aggregation
//!
//! Pushes every retained posterior sample through the softmax link at new
//! prediction points and summarizes the resulting ensemble of class
//! probabilities: per-point means, percentile bands, and categorical draws for
//! posterior-predictive simulation.

use crate::design::BlockDesign;
use crate::sampler::PosteriorSamples;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictiveError {
    #[error(
        "No samples remain after discarding a burn-in of {burn_in} from {total} samples."
    )]
    DegenerateSampleSet { total: usize, burn_in: usize },

    #[error(
        "Prediction design multiplies {expected} coefficients, but the samples have {found}."
    )]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Percentile {0} is outside [0, 100].")]
    InvalidPercentile(f64),

    #[error("Class probabilities at prediction point {point} do not form a distribution.")]
    InvalidProbabilities { point: usize },

    #[error("Posterior sample {sample} holds a non-finite coefficient.")]
    NonFiniteSample { sample: usize },

    #[error("Linear predictor at prediction point {point} is non-finite for posterior sample {sample}.")]
    NonFiniteLinearPredictor { point: usize, sample: usize },
}

/// Numerically stable softmax of one vector of linear predictors.
pub fn softmax(eta: ArrayView1<f64>) -> Array1<f64> {
    let max = eta.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    let mut out = eta.mapv(|v| (v - max).exp());
    let total = out.sum();
    out /= total;
    out
}

/// Class probabilities indexed `(class, prediction point, sample)`.
///
/// For every point and sample the class axis sums to one.
#[derive(Debug, Clone)]
pub struct ClassProbabilityTensor {
    probabilities: Array3<f64>,
}

/// Per-point summary of the ensemble, each array shaped `[classes, points]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveSummary {
    pub mean: Array2<f64>,
    pub bands: Vec<PercentileBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileBand {
    pub percentile: f64,
    pub values: Array2<f64>,
}

/// Computes class probabilities for every retained sample at the prediction points.
///
/// # Arguments
/// * `samples`: the full chain, one column per iteration.
/// * `burn_in`: leading columns to discard.
/// * `design`: block design of the `M` prediction points, built with the
///   training multi-index set so its columns line up with the coefficients.
pub fn class_probabilities(
    samples: &PosteriorSamples,
    burn_in: usize,
    design: &BlockDesign,
) -> Result<ClassProbabilityTensor, PredictiveError> {
    let retained = samples.discard_burn_in(burn_in);
    if retained.is_empty() {
        return Err(PredictiveError::DegenerateSampleSet {
            total: samples.len(),
            burn_in,
        });
    }
    if design.parameter_len() != retained.dim() {
        return Err(PredictiveError::DimensionMismatch {
            expected: design.parameter_len(),
            found: retained.dim(),
        });
    }

    if let Some(column) = retained
        .matrix()
        .axis_iter(Axis(1))
        .position(|column| column.iter().any(|v| !v.is_finite()))
    {
        return Err(PredictiveError::NonFiniteSample {
            sample: burn_in + column,
        });
    }

    let classes = design.num_classes();
    let points = design.num_observations();
    let n_samples = retained.len();

    // All linear predictors at once: [(M * K), S], rows interleaved by class.
    let eta = design.matrix().dot(&retained.matrix());
    if let Some(((row, column), _)) = eta.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(PredictiveError::NonFiniteLinearPredictor {
            point: row / classes,
            sample: burn_in + column,
        });
    }

    let mut probabilities = Array3::<f64>::zeros((classes, points, n_samples));
    probabilities
        .axis_iter_mut(Axis(2))
        .into_par_iter()
        .zip(eta.axis_iter(Axis(1)).into_par_iter())
        .for_each(|(mut slice, eta_sample)| {
            for m in 0..points {
                let p = softmax(eta_sample.slice(s![m * classes..(m + 1) * classes]));
                slice.column_mut(m).assign(&p);
            }
        });

    log::debug!(
        "Aggregated {} retained samples over {} prediction points and {} classes.",
        n_samples,
        points,
        classes
    );

    Ok(ClassProbabilityTensor { probabilities })
}

impl ClassProbabilityTensor {
    pub fn num_classes(&self) -> usize {
        self.probabilities.dim().0
    }

    pub fn num_points(&self) -> usize {
        self.probabilities.dim().1
    }

    pub fn num_samples(&self) -> usize {
        self.probabilities.dim().2
    }

    pub fn probabilities(&self) -> ArrayView3<'_, f64> {
        self.probabilities.view()
    }

    /// The `[classes, points]` probability slice of one sample.
    pub fn slice(&self, sample: usize) -> ArrayView2<'_, f64> {
        self.probabilities.index_axis(Axis(2), sample)
    }

    /// Mean over samples, shaped `[classes, points]`.
    pub fn mean(&self) -> Array2<f64> {
        self.probabilities
            .mean_axis(Axis(2))
            .unwrap_or_else(|| Array2::zeros((self.num_classes(), self.num_points())))
    }

    /// The `q`-th percentile over samples (linear interpolation between order
    /// statistics), shaped `[classes, points]`.
    pub fn percentile(&self, q: f64) -> Result<Array2<f64>, PredictiveError> {
        if !(0.0..=100.0).contains(&q) {
            return Err(PredictiveError::InvalidPercentile(q));
        }
        let (classes, points, _) = self.probabilities.dim();
        let mut out = Array2::zeros((classes, points));
        for c in 0..classes {
            for m in 0..points {
                let lane = self.probabilities.slice(s![c, m, ..]);
                out[[c, m]] = internal::interpolated_percentile(lane, q);
            }
        }
        Ok(out)
    }

    /// Mean plus one band per requested percentile.
    pub fn summarize(&self, percentiles: &[f64]) -> Result<PredictiveSummary, PredictiveError> {
        let bands = percentiles
            .iter()
            .map(|&q| {
                Ok(PercentileBand {
                    percentile: q,
                    values: self.percentile(q)?,
                })
            })
            .collect::<Result<Vec<_>, PredictiveError>>()?;
        Ok(PredictiveSummary {
            mean: self.mean(),
            bands,
        })
    }

    /// One posterior-predictive class draw per point and retained sample, shaped `[points, samples]`.
    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array2<usize>, PredictiveError> {
        let mut draws = Array2::zeros((self.num_points(), self.num_samples()));
        for sample in 0..self.num_samples() {
            let classes = draw_classes(self.slice(sample), rng)?;
            draws.column_mut(sample).assign(&Array1::from_vec(classes));
        }
        Ok(draws)
    }
}

/// Draws one class per prediction point from a `[classes, points]` probability slice.
pub fn draw_classes<R: Rng + ?Sized>(
    slice: ArrayView2<f64>,
    rng: &mut R,
) -> Result<Vec<usize>, PredictiveError> {
    slice
        .axis_iter(Axis(1))
        .enumerate()
        .map(|(point, probs)| {
            let dist = WeightedIndex::new(probs.iter())
                .map_err(|_| PredictiveError::InvalidProbabilities { point })?;
            Ok(dist.sample(&mut *rng))
        })
        .collect()
}

mod internal {
    use super::*;

    /// Linear interpolation between order statistics (type 7).
    pub(super) fn interpolated_percentile(values: ArrayView1<f64>, q: f64) -> f64 {
        let mut sorted = values.to_vec();
        sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        if n == 1 {
            return sorted[0];
        }
        let float_idx = (n as f64 - 1.0) * q / 100.0;
        let lower = float_idx.floor() as usize;
        let upper = float_idx.ceil() as usize;
        if lower == upper {
            sorted[lower]
        } else {
            let fraction = float_idx - lower as f64;
            sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn toy_design() -> BlockDesign {
        // Basis [1, x] at three prediction points, three classes.
        let per_class = array![[1.0, 0.0], [1.0, 0.5], [1.0, 1.0]];
        BlockDesign::assemble(per_class.view(), 3).unwrap()
    }

    fn toy_samples() -> PosteriorSamples {
        let mut rng = StdRng::seed_from_u64(7);
        let matrix = Array2::from_shape_fn((6, 200), |_| rng.gen_range(-3.0..3.0));
        PosteriorSamples::from_matrix(matrix)
    }

    #[test]
    fn test_softmax_is_stable_and_normalized() {
        let p = softmax(array![1000.0, 1000.0, -1000.0].view());
        assert_abs_diff_eq!(p[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let tensor = class_probabilities(&toy_samples(), 50, &toy_design()).unwrap();
        assert_eq!(tensor.num_classes(), 3);
        assert_eq!(tensor.num_points(), 3);
        assert_eq!(tensor.num_samples(), 150);
        for m in 0..tensor.num_points() {
            for sample in 0..tensor.num_samples() {
                let total: f64 = tensor.probabilities().slice(s![.., m, sample]).sum();
                assert!((total - 1.0).abs() <= 1e-9, "point {m} sample {sample}: {total}");
            }
        }
    }

    #[test]
    fn test_matches_direct_softmax_of_linear_predictors() {
        let samples = toy_samples();
        let design = toy_design();
        let tensor = class_probabilities(&samples, 0, &design).unwrap();
        let column = samples.column(17);
        let eta = design.linear_predictors(column).unwrap();
        for m in 0..3 {
            let expected = softmax(eta.row(m));
            for c in 0..3 {
                assert_abs_diff_eq!(
                    tensor.probabilities()[[c, m, 17]],
                    expected[c],
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn test_zero_coefficients_give_uniform_probabilities() {
        let samples = PosteriorSamples::from_matrix(Array2::zeros((6, 4)));
        let tensor = class_probabilities(&samples, 1, &toy_design()).unwrap();
        for &p in tensor.probabilities().iter() {
            assert_abs_diff_eq!(p, 1.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_bands_bracket_the_mean() {
        let tensor = class_probabilities(&toy_samples(), 0, &toy_design()).unwrap();
        let summary = tensor.summarize(&[1.0, 99.0]).unwrap();
        let low = &summary.bands[0].values;
        let high = &summary.bands[1].values;
        for ((l, m), h) in low.iter().zip(summary.mean.iter()).zip(high.iter()) {
            assert!(l <= m && m <= h, "{l} <= {m} <= {h}");
        }
        assert_eq!(summary.bands[0].percentile, 1.0);
    }

    #[test]
    fn test_non_finite_samples_are_rejected() {
        let mut matrix = Array2::zeros((6, 10));
        matrix[[2, 7]] = f64::INFINITY;
        let samples = PosteriorSamples::from_matrix(matrix.clone());
        assert!(matches!(
            class_probabilities(&samples, 3, &toy_design()),
            Err(PredictiveError::NonFiniteSample { sample: 7 })
        ));

        matrix[[2, 7]] = f64::NAN;
        let samples = PosteriorSamples::from_matrix(matrix);
        assert!(matches!(
            class_probabilities(&samples, 0, &toy_design()),
            Err(PredictiveError::NonFiniteSample { sample: 7 })
        ));
        // The bad column is dropped with the burn-in.
        assert!(class_probabilities(&samples, 8, &toy_design()).is_ok());
    }

    #[test]
    fn test_overflowing_linear_predictor_is_rejected() {
        let mut matrix = Array2::zeros((6, 4));
        // Class 1 intercept and slope at f64::MAX: finite at x = 0, overflows at x = 0.5.
        matrix[[2, 2]] = f64::MAX;
        matrix[[3, 2]] = f64::MAX;
        let samples = PosteriorSamples::from_matrix(matrix);
        match class_probabilities(&samples, 0, &toy_design()) {
            Err(PredictiveError::NonFiniteLinearPredictor { point, sample }) => {
                assert_eq!((point, sample), (1, 2));
            }
            other => panic!("Expected NonFiniteLinearPredictor, got {other:?}"),
        }
    }

    #[test]
    fn test_skewed_ensemble_percentile_can_exceed_mean() {
        // 100 samples at p = 0.99 and one at p = 0.01 for class 0.
        let probabilities = Array3::from_shape_fn((2, 1, 101), |(c, _, sample)| {
            let p = if sample == 0 { 0.01 } else { 0.99 };
            if c == 0 { p } else { 1.0 - p }
        });
        let tensor = ClassProbabilityTensor { probabilities };
        let summary = tensor.summarize(&[1.0, 99.0]).unwrap();
        let mean = summary.mean[[0, 0]];
        assert_abs_diff_eq!(mean, (100.0 * 0.99 + 0.01) / 101.0, epsilon = 1e-12);
        // Type-7 interpolation lands exactly on the second order statistic.
        assert_abs_diff_eq!(summary.bands[0].values[[0, 0]], 0.99, epsilon = 1e-12);
        assert!(summary.bands[0].values[[0, 0]] > mean);
        assert!(mean <= summary.bands[1].values[[0, 0]]);
    }

    #[test]
    fn test_interpolated_percentile() {
        let values = array![4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(internal::interpolated_percentile(values.view(), 0.0), 1.0);
        assert_eq!(internal::interpolated_percentile(values.view(), 50.0), 3.0);
        assert_eq!(internal::interpolated_percentile(values.view(), 100.0), 5.0);
        assert_abs_diff_eq!(
            internal::interpolated_percentile(values.view(), 10.0),
            1.4,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_degenerate_sample_set() {
        let samples = PosteriorSamples::from_matrix(Array2::zeros((6, 10)));
        for burn_in in [10, 11, 1_000] {
            match class_probabilities(&samples, burn_in, &toy_design()).unwrap_err() {
                PredictiveError::DegenerateSampleSet { total, .. } => assert_eq!(total, 10),
                other => panic!("Expected DegenerateSampleSet, got {other:?}"),
            }
        }
        let empty = PosteriorSamples::from_matrix(Array2::zeros((6, 0)));
        assert!(matches!(
            class_probabilities(&empty, 0, &toy_design()),
            Err(PredictiveError::DegenerateSampleSet { .. })
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let samples = PosteriorSamples::from_matrix(Array2::zeros((5, 10)));
        assert!(matches!(
            class_probabilities(&samples, 0, &toy_design()),
            Err(PredictiveError::DimensionMismatch {
                expected: 6,
                found: 5
            })
        ));
    }

    #[test]
    fn test_invalid_percentile() {
        let tensor = class_probabilities(&toy_samples(), 0, &toy_design()).unwrap();
        assert!(matches!(
            tensor.percentile(101.0),
            Err(PredictiveError::InvalidPercentile(_))
        ));
        assert!(tensor.summarize(&[-1.0]).is_err());
    }

    #[test]
    fn test_categorical_draws_follow_probabilities() {
        let slice = array![[1.0, 0.0, 0.2], [0.0, 0.0, 0.8], [0.0, 1.0, 0.0]];
        let mut rng = StdRng::seed_from_u64(3);
        let mut third_point_ones = 0;
        for _ in 0..2_000 {
            let draws = draw_classes(slice.view(), &mut rng).unwrap();
            assert_eq!(draws[0], 0);
            assert_eq!(draws[1], 2);
            assert_ne!(draws[2], 2);
            if draws[2] == 1 {
                third_point_ones += 1;
            }
        }
        let share = third_point_ones as f64 / 2_000.0;
        assert_abs_diff_eq!(share, 0.8, epsilon = 0.05);

        let broken = array![[0.0], [0.0]];
        assert!(matches!(
            draw_classes(broken.view(), &mut rng),
            Err(PredictiveError::InvalidProbabilities { point: 0 })
        ));
    }

    #[test]
    fn test_simulate_shape() {
        let tensor = class_probabilities(&toy_samples(), 100, &toy_design()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let draws = tensor.simulate(&mut rng).unwrap();
        assert_eq!(draws.dim(), (3, 100));
        assert!(draws.iter().all(|&c| c < 3));
    }
}
