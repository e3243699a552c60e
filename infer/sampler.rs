//! # Posterior Sampler Adapter
//!
//! Translates a sampler configuration record into a running Markov chain and
//! returns the chain states as a `dim × num_samples` matrix, one column per
//! iteration in iteration order.
//!
//! The chain itself is produced by a [`SamplerEngine`]. The bundled engine,
//! [`AdaptiveMetropolis`], drives a `mini_mcmc` Metropolis-Hastings chain with
//! a [`GaussianProposal`] and, between blocks of `adapt_steps` iterations,
//! hands it a proposal whose covariance is re-estimated from the chain
//! history. Any other engine plugs in through the same trait.
//!
//! Runs are blocking but cooperative: a [`CancellationToken`] (optionally with
//! a deadline) is polled every iteration, and a [`SamplerObserver`] sees every
//! accept/reject decision.

use mini_mcmc::core::MarkovChain;
use mini_mcmc::distributions::Proposal;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Jitter added to the adapted covariance so it stays positive definite.
const ADAPTATION_JITTER: f64 = 1.0e-10;

/// Acceptance rates below this are reported once a run finishes.
const LOW_ACCEPTANCE_WARNING: f64 = 0.05;

/// A scalar log-density of a vector parameter. Non-finite values mean "reject".
pub trait LogDensity {
    fn dim(&self) -> usize;
    fn log_density(&self, x: ArrayView1<f64>) -> f64;
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Invalid sampler configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Initial point has length {found}, but the target has dimension {expected}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("The log-density at the initial point is {0}; the chain cannot start from an impossible state.")]
    NonFiniteStart(f64),

    #[error("At least one chain start is required.")]
    NoChains,
}

/// Proposal family handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    /// Fixed isotropic Gaussian random walk.
    RandomWalk,
    /// Random walk whose covariance is re-estimated from the chain history.
    #[default]
    AdaptiveMetropolis,
}

/// The configuration record of a sampler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub proposal_kind: ProposalKind,
    /// Variance of the isotropic proposal used until adaptation starts.
    pub proposal_variance: f64,
    /// Iterations between covariance re-estimates.
    pub adapt_steps: usize,
    /// First iteration at which the covariance may be re-estimated.
    pub adapt_start: usize,
    /// Multiplier applied to the empirical covariance.
    pub adapt_scale: f64,
    /// Total iterations, equal to the number of columns returned.
    pub num_samples: usize,
    /// Independent chains to run in parallel.
    pub num_chains: usize,
    /// Seed for reproducible runs; chain `i` uses `seed + i`.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            proposal_kind: ProposalKind::AdaptiveMetropolis,
            proposal_variance: 1.0e-2,
            adapt_steps: 100,
            adapt_start: 1000,
            adapt_scale: 0.5,
            num_samples: 20_000,
            num_chains: 1,
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        let invalid = |field: &'static str, reason: &str| SamplerError::InvalidConfig {
            field,
            reason: reason.to_string(),
        };
        if self.num_samples == 0 {
            return Err(invalid("num_samples", "must be at least 1"));
        }
        if self.num_chains == 0 {
            return Err(invalid("num_chains", "must be at least 1"));
        }
        if !self.proposal_variance.is_finite() || self.proposal_variance <= 0.0 {
            return Err(invalid("proposal_variance", "must be finite and positive"));
        }
        if self.proposal_kind == ProposalKind::AdaptiveMetropolis {
            if self.adapt_steps == 0 {
                return Err(invalid("adapt_steps", "must be at least 1"));
            }
            if !self.adapt_scale.is_finite() || self.adapt_scale <= 0.0 {
                return Err(invalid("adapt_scale", "must be finite and positive"));
            }
        }
        Ok(())
    }
}

/// Cooperative stop signal shared between a caller and running chains.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Observer for reporting progress while a chain runs.
pub trait SamplerObserver {
    fn on_start(&mut self, total_iterations: usize) {
        let _ = total_iterations;
    }
    fn on_iteration(&mut self, iteration: usize, accepted: bool) {
        let _ = (iteration, accepted);
    }
    fn on_finish(&mut self, completed_iterations: usize, accepted: usize) {
        let _ = (completed_iterations, accepted);
    }
}

#[derive(Default)]
pub struct NoopObserver;

impl SamplerObserver for NoopObserver {}

/// Posterior samples, one column per chain state, in iteration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSamples {
    matrix: Array2<f64>,
}

impl PosteriorSamples {
    /// Wraps a `dim × num_samples` matrix.
    pub fn from_matrix(matrix: Array2<f64>) -> Self {
        Self { matrix }
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn len(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.ncols() == 0
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, f64> {
        self.matrix.column(index)
    }

    /// The samples after dropping the first `burn_in` columns. May be empty.
    pub fn discard_burn_in(&self, burn_in: usize) -> PosteriorSamples {
        let start = burn_in.min(self.len());
        Self {
            matrix: self.matrix.slice(s![.., start..]).to_owned(),
        }
    }

    /// Per-coordinate mean, or `None` for an empty set.
    pub fn mean(&self) -> Option<Array1<f64>> {
        self.matrix.mean_axis(Axis(1))
    }

    /// Per-coordinate standard deviation (population), or `None` for an empty set.
    pub fn std(&self) -> Option<Array1<f64>> {
        if self.is_empty() {
            return None;
        }
        Some(self.matrix.std_axis(Axis(1), 0.0))
    }

    /// Joins chains column-wise. All chains must share one dimension.
    pub fn concatenate(chains: &[PosteriorSamples]) -> Result<PosteriorSamples, SamplerError> {
        let first = chains.first().ok_or(SamplerError::NoChains)?;
        if let Some(bad) = chains.iter().find(|c| c.dim() != first.dim()) {
            return Err(SamplerError::DimensionMismatch {
                expected: first.dim(),
                found: bad.dim(),
            });
        }
        let views: Vec<ArrayView2<f64>> = chains.iter().map(|c| c.matrix.view()).collect();
        let matrix = ndarray::concatenate(Axis(1), &views).map_err(|_| {
            SamplerError::DimensionMismatch {
                expected: first.dim(),
                found: 0,
            }
        })?;
        Ok(Self { matrix })
    }
}

/// Result of one chain.
#[derive(Debug, Clone)]
pub struct SamplerRun {
    pub samples: PosteriorSamples,
    pub accepted: usize,
    pub acceptance_rate: f64,
    /// True when the run stopped early; `samples` then holds the completed prefix.
    pub cancelled: bool,
}

/// The external-engine seam: anything that turns a configuration record and a
/// log-density into a chain.
pub trait SamplerEngine {
    fn sample(
        &self,
        config: &SamplerConfig,
        target: &(dyn LogDensity + Sync),
        initial: ArrayView1<f64>,
        cancel: &CancellationToken,
        observer: &mut dyn SamplerObserver,
    ) -> Result<SamplerRun, SamplerError>;
}

/// A validated configuration, ready to run.
#[derive(Debug, Clone)]
pub struct SamplerHandle {
    config: SamplerConfig,
}

/// Validates a configuration record and returns a handle for running chains.
pub fn configure(config: SamplerConfig) -> Result<SamplerHandle, SamplerError> {
    config.validate()?;
    Ok(SamplerHandle { config })
}

impl SamplerHandle {
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Runs a single chain with the bundled engine until the configured length.
    pub fn run(
        &self,
        target: &(dyn LogDensity + Sync),
        initial: ArrayView1<f64>,
    ) -> Result<SamplerRun, SamplerError> {
        self.run_with(target, initial, &CancellationToken::new(), &mut NoopObserver)
    }

    /// Runs a single chain with the bundled engine, honouring cancellation.
    pub fn run_with(
        &self,
        target: &(dyn LogDensity + Sync),
        initial: ArrayView1<f64>,
        cancel: &CancellationToken,
        observer: &mut dyn SamplerObserver,
    ) -> Result<SamplerRun, SamplerError> {
        self.run_with_engine(&AdaptiveMetropolis, target, initial, cancel, observer)
    }

    /// Runs a single chain on a caller-supplied engine.
    pub fn run_with_engine(
        &self,
        engine: &dyn SamplerEngine,
        target: &(dyn LogDensity + Sync),
        initial: ArrayView1<f64>,
        cancel: &CancellationToken,
        observer: &mut dyn SamplerObserver,
    ) -> Result<SamplerRun, SamplerError> {
        if initial.len() != target.dim() {
            return Err(SamplerError::DimensionMismatch {
                expected: target.dim(),
                found: initial.len(),
            });
        }
        log::info!(
            "Starting {:?} chain: {} iterations over {} parameters.",
            self.config.proposal_kind,
            self.config.num_samples,
            target.dim()
        );
        let run = engine.sample(&self.config, target, initial, cancel, observer)?;
        if run.cancelled {
            log::warn!(
                "Sampling cancelled after {} of {} iterations.",
                run.samples.len(),
                self.config.num_samples
            );
        } else {
            log::info!(
                "Sampling complete: acceptance rate {:.3}.",
                run.acceptance_rate
            );
        }
        if run.acceptance_rate < LOW_ACCEPTANCE_WARNING && !run.samples.is_empty() {
            log::warn!(
                "Acceptance rate {:.4} is very low; consider a smaller proposal_variance.",
                run.acceptance_rate
            );
        }
        Ok(run)
    }

    /// Runs one independent chain per start point in parallel.
    ///
    /// Each chain owns its sample matrix until it completes. Chain `i` is
    /// seeded with `seed + i` when a seed is configured.
    pub fn run_chains<T>(
        &self,
        target: &T,
        starts: &[Array1<f64>],
        cancel: &CancellationToken,
    ) -> Result<Vec<SamplerRun>, SamplerError>
    where
        T: LogDensity + Sync,
    {
        if starts.is_empty() {
            return Err(SamplerError::NoChains);
        }
        starts
            .par_iter()
            .enumerate()
            .map(|(chain, start)| {
                let mut config = self.config.clone();
                config.seed = self.config.seed.map(|seed| seed.wrapping_add(chain as u64));
                let handle = SamplerHandle { config };
                handle.run_with(target, start.view(), cancel, &mut NoopObserver)
            })
            .collect()
    }
}

/// Multivariate normal random-walk proposal `N(x, L L^T)` for `mini_mcmc`
/// chains, given the lower Cholesky factor `L`.
#[derive(Debug, Clone)]
pub struct GaussianProposal {
    factor: Array2<f64>,
    log_normalizer: f64,
    rng: StdRng,
}

impl GaussianProposal {
    /// `N(x, variance * I)`.
    pub fn isotropic(dim: usize, variance: f64, seed: u64) -> Self {
        Self::from_factor(Array2::eye(dim) * variance.sqrt(), seed)
    }

    /// Proposal with covariance `factor * factor^T`; `factor` must be lower triangular.
    pub fn from_factor(factor: Array2<f64>, seed: u64) -> Self {
        let dim = factor.nrows() as f64;
        let log_det_factor: f64 = factor.diag().iter().map(|d| d.abs().ln()).sum();
        Self {
            log_normalizer: -0.5 * dim * (2.0 * std::f64::consts::PI).ln() - log_det_factor,
            factor,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn dim(&self) -> usize {
        self.factor.nrows()
    }
}

impl Proposal<f64, f64> for GaussianProposal {
    fn sample(&mut self, current: &[f64]) -> Vec<f64> {
        let z: Array1<f64> = (0..self.dim())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        let step = self.factor.dot(&z);
        current.iter().zip(step.iter()).map(|(x, d)| x + d).collect()
    }

    fn logp(&self, from: &[f64], to: &[f64]) -> f64 {
        let offset: Array1<f64> = to.iter().zip(from).map(|(t, f)| t - f).collect();
        match self
            .factor
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &offset)
        {
            Ok(whitened) => self.log_normalizer - 0.5 * whitened.dot(&whitened),
            Err(_) => f64::NEG_INFINITY,
        }
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

/// Random-walk Metropolis-Hastings with an optionally adapted Gaussian proposal.
///
/// Until `adapt_start` the proposal is `N(x, proposal_variance * I)`. From then
/// on, every `adapt_steps` iterations the chain continues from its current
/// state under a new proposal with covariance `adapt_scale * C + jitter * I`,
/// where `C` is the empirical covariance of all states visited so far.
///
/// Stepping and the accept/reject decision belong to `mini_mcmc`; this type
/// only schedules proposals, polls for cancellation and records states.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveMetropolis;

impl SamplerEngine for AdaptiveMetropolis {
    fn sample(
        &self,
        config: &SamplerConfig,
        target: &(dyn LogDensity + Sync),
        initial: ArrayView1<f64>,
        cancel: &CancellationToken,
        observer: &mut dyn SamplerObserver,
    ) -> Result<SamplerRun, SamplerError> {
        config.validate()?;
        let dim = target.dim();
        if initial.len() != dim {
            return Err(SamplerError::DimensionMismatch {
                expected: dim,
                found: initial.len(),
            });
        }

        let start_lp = target.log_density(initial);
        if !start_lp.is_finite() {
            return Err(SamplerError::NonFiniteStart(start_lp));
        }

        // Every chain segment and proposal draws its seed from here.
        let mut seeds = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let adaptive = config.proposal_kind == ProposalKind::AdaptiveMetropolis;
        let density = internal::DensityTarget { inner: target };

        let mut current = initial.to_vec();
        let mut chain = internal::start_chain(
            density,
            GaussianProposal::isotropic(dim, config.proposal_variance, seeds.next_u64()),
            &current,
            seeds.next_u64(),
        )?;
        let mut history = internal::RunningMoments::new(dim);
        let mut samples = Array2::<f64>::zeros((dim, config.num_samples));
        let mut accepted = 0usize;
        let mut completed = 0usize;
        let mut cancelled = false;

        observer.on_start(config.num_samples);
        for iteration in 0..config.num_samples {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let state = chain.step();
            // A continuous proposal reproduces the current state only on rejection.
            let is_accepted = *state != current;
            if is_accepted {
                current.clone_from(state);
                accepted += 1;
            }

            let state = ArrayView1::from(current.as_slice());
            samples.column_mut(iteration).assign(&state);
            if adaptive {
                history.push(state);
            }
            completed = iteration + 1;
            observer.on_iteration(iteration, is_accepted);

            if adaptive
                && completed >= config.adapt_start.max(2)
                && completed % config.adapt_steps == 0
            {
                let adapted = history.covariance() * config.adapt_scale
                    + Array2::<f64>::eye(dim) * ADAPTATION_JITTER;
                match adapted.cholesky(UPLO::Lower) {
                    Ok(lower) => {
                        log::debug!(
                            "Adapted proposal covariance at iteration {} (acceptance so far {:.3}).",
                            completed,
                            accepted as f64 / completed as f64
                        );
                        chain = internal::start_chain(
                            density,
                            GaussianProposal::from_factor(lower, seeds.next_u64()),
                            &current,
                            seeds.next_u64(),
                        )?;
                    }
                    Err(e) => {
                        log::warn!(
                            "Keeping previous proposal at iteration {completed}: covariance factorization failed ({e})."
                        );
                    }
                }
            }
        }
        observer.on_finish(completed, accepted);

        let samples = if completed < config.num_samples {
            samples.slice(s![.., ..completed]).to_owned()
        } else {
            samples
        };
        let acceptance_rate = if completed == 0 {
            0.0
        } else {
            accepted as f64 / completed as f64
        };

        Ok(SamplerRun {
            samples: PosteriorSamples::from_matrix(samples),
            accepted,
            acceptance_rate,
            cancelled,
        })
    }
}

mod internal {
    use super::*;
    use mini_mcmc::distributions::Target;
    use mini_mcmc::metropolis_hastings::{MHMarkovChain, MetropolisHastings};

    /// A borrowed log-density seen through the `mini_mcmc` target interface.
    #[derive(Clone, Copy)]
    pub(super) struct DensityTarget<'a> {
        pub(super) inner: &'a (dyn LogDensity + Sync),
    }

    impl Target<f64, f64> for DensityTarget<'_> {
        /// Non-finite values, including NaN, map to `-inf` so they are always rejected.
        fn unnorm_logp(&self, theta: &[f64]) -> f64 {
            let value = self.inner.log_density(ArrayView1::from(theta));
            if value.is_finite() {
                value
            } else {
                f64::NEG_INFINITY
            }
        }
    }

    pub(super) type Chain<'a> = MHMarkovChain<f64, f64, DensityTarget<'a>, GaussianProposal>;

    /// A single seeded Metropolis-Hastings chain starting at `state`.
    pub(super) fn start_chain<'a>(
        density: DensityTarget<'a>,
        proposal: GaussianProposal,
        state: &[f64],
        seed: u64,
    ) -> Result<Chain<'a>, SamplerError> {
        let mut sampler =
            MetropolisHastings::new(density, proposal, vec![state.to_vec()]).seed(seed);
        sampler.chains.pop().ok_or(SamplerError::NoChains)
    }

    /// Welford accumulator for the mean and covariance of chain states.
    pub(super) struct RunningMoments {
        count: usize,
        mean: Array1<f64>,
        m2: Array2<f64>,
    }

    impl RunningMoments {
        pub(super) fn new(dim: usize) -> Self {
            Self {
                count: 0,
                mean: Array1::zeros(dim),
                m2: Array2::zeros((dim, dim)),
            }
        }

        pub(super) fn push(&mut self, x: ArrayView1<f64>) {
            self.count += 1;
            let delta = &x - &self.mean;
            self.mean.scaled_add(1.0 / self.count as f64, &delta);
            let delta_after = &x - &self.mean;
            let dim = delta.len();
            for i in 0..dim {
                for j in 0..dim {
                    self.m2[[i, j]] += delta[i] * delta_after[j];
                }
            }
        }

        /// Unbiased sample covariance; zero until two states have been seen.
        pub(super) fn covariance(&self) -> Array2<f64> {
            if self.count < 2 {
                return Array2::zeros(self.m2.dim());
            }
            &self.m2 / (self.count as f64 - 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Independent normal target with the given means and standard deviations.
    struct NormalTarget {
        mean: Array1<f64>,
        sd: Array1<f64>,
    }

    impl LogDensity for NormalTarget {
        fn dim(&self) -> usize {
            self.mean.len()
        }

        fn log_density(&self, x: ArrayView1<f64>) -> f64 {
            x.iter()
                .zip(self.mean.iter().zip(self.sd.iter()))
                .map(|(xi, (m, s))| -0.5 * ((xi - m) / s).powi(2))
                .sum()
        }
    }

    /// Uniform on the positive half-line; `-inf` elsewhere.
    struct HalfLine;

    impl LogDensity for HalfLine {
        fn dim(&self) -> usize {
            1
        }

        fn log_density(&self, x: ArrayView1<f64>) -> f64 {
            if x[0] > 0.0 && x[0] < 10.0 {
                0.0
            } else {
                f64::NEG_INFINITY
            }
        }
    }

    fn seeded(num_samples: usize) -> SamplerConfig {
        SamplerConfig {
            num_samples,
            proposal_variance: 0.5,
            adapt_start: 500,
            adapt_steps: 100,
            adapt_scale: 2.4 * 2.4 / 2.0,
            seed: Some(42),
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn test_samples_matrix_layout() {
        let target = NormalTarget {
            mean: array![0.0, 0.0],
            sd: array![1.0, 1.0],
        };
        let handle = configure(seeded(250)).unwrap();
        let run = handle.run(&target, array![0.0, 0.0].view()).unwrap();
        assert_eq!(run.samples.dim(), 2);
        assert_eq!(run.samples.len(), 250);
        assert!(!run.cancelled);
        assert!(run.acceptance_rate > 0.0 && run.acceptance_rate <= 1.0);
    }

    #[test]
    fn test_adaptive_chain_recovers_target_moments() {
        let target = NormalTarget {
            mean: array![1.0, -2.0],
            sd: array![0.5, 2.0],
        };
        let handle = configure(seeded(20_000)).unwrap();
        let run = handle.run(&target, array![0.0, 0.0].view()).unwrap();
        let kept = run.samples.discard_burn_in(2_000);
        let mean = kept.mean().unwrap();
        let std = kept.std().unwrap();
        assert_abs_diff_eq!(mean[0], 1.0, epsilon = 0.15);
        assert_abs_diff_eq!(mean[1], -2.0, epsilon = 0.5);
        assert_abs_diff_eq!(std[0], 0.5, epsilon = 0.15);
        assert_abs_diff_eq!(std[1], 2.0, epsilon = 0.5);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let target = NormalTarget {
            mean: array![0.0],
            sd: array![1.0],
        };
        let handle = configure(seeded(300)).unwrap();
        let a = handle.run(&target, array![0.0].view()).unwrap();
        let b = handle.run(&target, array![0.0].view()).unwrap();
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_infinite_density_is_never_accepted() {
        let handle = configure(SamplerConfig {
            proposal_variance: 25.0,
            ..seeded(2_000)
        })
        .unwrap();
        let run = handle.run(&HalfLine, array![5.0].view()).unwrap();
        assert!(run.samples.matrix().iter().all(|&x| x > 0.0 && x < 10.0));
    }

    #[test]
    fn test_non_finite_start_is_an_error() {
        let handle = configure(seeded(10)).unwrap();
        assert!(matches!(
            handle.run(&HalfLine, array![-1.0].view()),
            Err(SamplerError::NonFiniteStart(_))
        ));
        assert!(matches!(
            handle.run(&HalfLine, array![1.0, 2.0].view()),
            Err(SamplerError::DimensionMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_pre_cancelled_run_returns_empty_prefix() {
        let target = NormalTarget {
            mean: array![0.0],
            sd: array![1.0],
        };
        let handle = configure(seeded(1_000)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let run = handle
            .run_with(&target, array![0.0].view(), &token, &mut NoopObserver)
            .unwrap();
        assert!(run.cancelled);
        assert!(run.samples.is_empty());
        assert_eq!(run.samples.dim(), 1);
    }

    #[test]
    fn test_observer_can_cancel_mid_run() {
        struct StopAfter {
            token: CancellationToken,
            limit: usize,
            seen: usize,
            started: Option<usize>,
        }
        impl SamplerObserver for StopAfter {
            fn on_start(&mut self, total_iterations: usize) {
                self.started = Some(total_iterations);
            }
            fn on_iteration(&mut self, iteration: usize, accepted: bool) {
                let _ = accepted;
                self.seen = iteration + 1;
                if self.seen == self.limit {
                    self.token.cancel();
                }
            }
        }

        let target = NormalTarget {
            mean: array![0.0],
            sd: array![1.0],
        };
        let handle = configure(seeded(1_000)).unwrap();
        let token = CancellationToken::new();
        let mut observer = StopAfter {
            token: token.clone(),
            limit: 37,
            seen: 0,
            started: None,
        };
        let run = handle
            .run_with(&target, array![0.0].view(), &token, &mut observer)
            .unwrap();
        assert_eq!(observer.started, Some(1_000));
        assert!(run.cancelled);
        assert_eq!(run.samples.len(), 37);
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let token = CancellationToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        assert!(!CancellationToken::new().is_cancelled());
    }

    #[test]
    fn test_parallel_chains_are_independent() {
        let target = NormalTarget {
            mean: array![0.0, 0.0],
            sd: array![1.0, 1.0],
        };
        let handle = configure(seeded(500)).unwrap();
        let starts = vec![array![0.0, 0.0], array![1.0, 1.0], array![-1.0, 0.5]];
        let runs = handle
            .run_chains(&target, &starts, &CancellationToken::new())
            .unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.samples.len() == 500));
        assert_ne!(runs[0].samples, runs[1].samples);

        let joined = PosteriorSamples::concatenate(
            &runs.into_iter().map(|r| r.samples).collect::<Vec<_>>(),
        )
        .unwrap();
        assert_eq!(joined.len(), 1_500);
        assert!(matches!(
            handle.run_chains(&target, &[], &CancellationToken::new()),
            Err(SamplerError::NoChains)
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(configure(SamplerConfig::default()).is_ok());
        for bad in [
            SamplerConfig {
                num_samples: 0,
                ..SamplerConfig::default()
            },
            SamplerConfig {
                proposal_variance: -1.0,
                ..SamplerConfig::default()
            },
            SamplerConfig {
                adapt_steps: 0,
                ..SamplerConfig::default()
            },
            SamplerConfig {
                adapt_scale: f64::NAN,
                ..SamplerConfig::default()
            },
        ] {
            assert!(matches!(
                configure(bad),
                Err(SamplerError::InvalidConfig { .. })
            ));
        }
        // Adaptation settings are irrelevant to a plain random walk.
        assert!(
            configure(SamplerConfig {
                proposal_kind: ProposalKind::RandomWalk,
                adapt_steps: 0,
                ..SamplerConfig::default()
            })
            .is_ok()
        );
    }

    #[test]
    fn test_gaussian_proposal_density_and_draws() {
        let proposal = GaussianProposal::isotropic(1, 4.0, 1);
        let expected = -0.5 * (2.0 * std::f64::consts::PI * 4.0).ln() - 0.5;
        assert_abs_diff_eq!(proposal.logp(&[0.0], &[2.0]), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(
            proposal.logp(&[2.0], &[0.0]),
            proposal.logp(&[0.0], &[2.0]),
            epsilon = 1e-12
        );

        let factor = array![[1.0, 0.0], [0.5, 2.0]];
        let mut correlated = GaussianProposal::from_factor(factor.clone(), 9).set_seed(9);
        let draws: Vec<Vec<f64>> = (0..20_000).map(|_| correlated.sample(&[1.0, -1.0])).collect();
        let mut moments = internal::RunningMoments::new(2);
        for draw in &draws {
            moments.push(ArrayView1::from(draw.as_slice()));
        }
        let cov = moments.covariance();
        let target = factor.dot(&factor.t());
        assert_abs_diff_eq!(cov[[0, 0]], target[[0, 0]], epsilon = 0.1);
        assert_abs_diff_eq!(cov[[0, 1]], target[[0, 1]], epsilon = 0.1);
        assert_abs_diff_eq!(cov[[1, 1]], target[[1, 1]], epsilon = 0.3);
    }

    #[test]
    fn test_random_walk_keeps_a_fixed_proposal() {
        let target = NormalTarget {
            mean: array![0.0],
            sd: array![1.0],
        };
        let handle = configure(SamplerConfig {
            proposal_kind: ProposalKind::RandomWalk,
            proposal_variance: 1.0,
            ..seeded(5_000)
        })
        .unwrap();
        let run = handle.run(&target, array![3.0].view()).unwrap();
        assert_eq!(run.samples.len(), 5_000);
        assert!(run.accepted > 0 && run.accepted < 5_000);
        let mean = run.samples.discard_burn_in(500).mean().unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 0.25);
    }

    #[test]
    fn test_burn_in_and_running_moments() {
        let samples = PosteriorSamples::from_matrix(array![[1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(samples.discard_burn_in(1).len(), 3);
        assert!(samples.discard_burn_in(4).is_empty());
        assert!(samples.discard_burn_in(10).is_empty());
        assert_abs_diff_eq!(samples.mean().unwrap()[0], 2.5);

        let mut moments = internal::RunningMoments::new(2);
        for x in [array![1.0, 2.0], array![3.0, 2.0], array![5.0, 8.0]] {
            moments.push(x.view());
        }
        let cov = moments.covariance();
        assert_abs_diff_eq!(cov[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 1]], 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 0]], 6.0, epsilon = 1e-12);
    }
}
