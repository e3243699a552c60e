//! End-to-end orchestration: basis expansion, block design, posterior
//! composition, sampling and posterior-predictive aggregation.

use crate::basis::{self, BasisError};
use crate::config::{ConfigError, PipelineConfig};
use crate::covariates::{self, CovariateError, CovariateRecord, CovariateScaling, ObservationSet};
use crate::data::{CovariateTable, DataError, TrainingTable};
use crate::design::{BlockDesign, DesignError};
use crate::multi_index::MultiIndexSet;
use crate::posterior::{GaussianPrior, ModelError, PosteriorModel};
use crate::predictive::{self, ClassProbabilityTensor, PredictiveError, PredictiveSummary};
use crate::sampler::{
    self, CancellationToken, NoopObserver, PosteriorSamples, SamplerError, SamplerObserver,
};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Covariate error: {0}")]
    Covariate(#[from] CovariateError),
    #[error("Basis construction failed: {0}")]
    Basis(#[from] BasisError),
    #[error("Design assembly failed: {0}")]
    Design(#[from] DesignError),
    #[error("Posterior composition failed: {0}")]
    Model(#[from] ModelError),
    #[error("Sampling failed: {0}")]
    Sampler(#[from] SamplerError),
    #[error("Posterior-predictive aggregation failed: {0}")]
    Predictive(#[from] PredictiveError),
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model was trained with {expected} classes but the observations declare {found}.")]
    ClassCountMismatch { expected: usize, found: usize },
    #[error("No coefficient samples survived burn-in ({burn_in} discarded).")]
    NoRetainedSamples { burn_in: usize },
}

/// A fitted model: everything needed to predict at new covariates.
///
/// Samples are stored after burn-in, so prediction aggregates every column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    /// Mean acceptance rate over all chains.
    pub acceptance_rate: f64,
    pub cancelled: bool,
    pub config: PipelineConfig,
    /// Ranges used to scale raw time and latitude, when the model was fitted from raw data.
    pub scaling: Option<CovariateScaling>,
    pub multi_indices: MultiIndexSet,
    pub samples: PosteriorSamples,
}

/// Scales raw training columns and validates labels.
pub fn prepare_observations(
    table: &TrainingTable,
    num_classes: usize,
) -> Result<(CovariateScaling, ObservationSet), PipelineError> {
    let raw = &table.covariates;
    let scaling = CovariateScaling::fit(&raw.times, &raw.latitudes)?;
    let records = scaling.scale_all(&raw.times, &raw.latitudes, &raw.longitudes)?;
    let observations = ObservationSet::new(records, table.labels.clone(), num_classes)?;
    log::info!(
        "Scaled {} observations (time range {:?}, latitude range {:?}).",
        observations.len(),
        scaling.time_range,
        scaling.latitude_range
    );
    Ok((scaling, observations))
}

/// Fits the model with no progress reporting and no cancellation.
pub fn fit(
    config: &PipelineConfig,
    observations: &ObservationSet,
) -> Result<FittedModel, PipelineError> {
    fit_with(config, observations, &CancellationToken::new(), &mut NoopObserver)
}

/// Builds the basis, assembles the block design, composes the posterior and
/// samples it from the zero vector.
///
/// A single chain reports to `observer`; multiple chains run in parallel
/// without per-iteration reporting. Burn-in is discarded per chain before the
/// chains are joined.
pub fn fit_with(
    config: &PipelineConfig,
    observations: &ObservationSet,
    cancel: &CancellationToken,
    observer: &mut dyn SamplerObserver,
) -> Result<FittedModel, PipelineError> {
    config.validate()?;
    let num_classes = config.model.num_classes;
    if observations.num_classes() != num_classes {
        return Err(PipelineError::ClassCountMismatch {
            expected: num_classes,
            found: observations.num_classes(),
        });
    }

    log::info!(
        "Building {:?} basis of order {} over {} observations.",
        config.model.family,
        config.model.max_order,
        observations.len()
    );
    let covariates = observations.covariate_matrix();
    let vandermonde =
        basis::build_vandermonde(covariates.view(), config.model.max_order, config.model.family)?;

    let design = BlockDesign::assemble(vandermonde.matrix.view(), num_classes)?;
    log::info!(
        "Block design: {} x {} ({} terms per class).",
        design.matrix().nrows(),
        design.matrix().ncols(),
        design.terms_per_class()
    );

    let prior = GaussianPrior::isotropic(design.parameter_len(), config.model.prior_variance);
    let model = PosteriorModel::compose(&design, observations.labels().view(), &prior)?;

    let handle = sampler::configure(config.sampler.clone())?;
    let start = Array1::zeros(model.dim());
    let runs = if config.sampler.num_chains == 1 {
        vec![handle.run_with(&model, start.view(), cancel, observer)?]
    } else {
        log::info!("Running {} chains in parallel.", config.sampler.num_chains);
        let starts = vec![start; config.sampler.num_chains];
        handle.run_chains(&model, &starts, cancel)?
    };

    let burn_in = config.prediction.burn_in;
    let retained: Vec<PosteriorSamples> = runs
        .iter()
        .map(|run| run.samples.discard_burn_in(burn_in))
        .collect();
    let samples = PosteriorSamples::concatenate(&retained)?;
    if samples.is_empty() {
        return Err(PipelineError::NoRetainedSamples { burn_in });
    }

    let acceptance_rate =
        runs.iter().map(|run| run.acceptance_rate).sum::<f64>() / runs.len() as f64;
    let cancelled = runs.iter().any(|run| run.cancelled);
    log::info!(
        "Retained {} samples after burn-in of {} per chain.",
        samples.len(),
        burn_in
    );

    Ok(FittedModel {
        acceptance_rate,
        cancelled,
        config: config.clone(),
        scaling: None,
        multi_indices: vandermonde.multi_indices,
        samples,
    })
}

impl FittedModel {
    pub fn with_scaling(mut self, scaling: CovariateScaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// Class-probability tensor at already-scaled covariates. Every record
    /// must lie in `[0, 1]`.
    pub fn class_probabilities(
        &self,
        records: &[CovariateRecord],
    ) -> Result<ClassProbabilityTensor, PipelineError> {
        covariates::check_records(records)?;
        let covariates = covariates::covariate_matrix(records);
        let per_class = basis::evaluate_basis(
            covariates.view(),
            &self.multi_indices,
            self.config.model.family,
        )?;
        let design = BlockDesign::assemble(per_class.view(), self.config.model.num_classes)?;
        Ok(predictive::class_probabilities(&self.samples, 0, &design)?)
    }

    /// Mean and percentile bands of the class probabilities at scaled covariates.
    pub fn predict(&self, records: &[CovariateRecord]) -> Result<PredictiveSummary, PipelineError> {
        log::info!("Predicting at {} points.", records.len());
        let tensor = self.class_probabilities(records)?;
        Ok(tensor.summarize(&self.config.prediction.percentiles)?)
    }

    /// Scales a raw grid with the training ranges and predicts.
    ///
    /// A model fitted from pre-scaled records has no ranges; its grid is taken
    /// to be scaled already, with longitude still in degrees.
    pub fn predict_table(&self, grid: &CovariateTable) -> Result<PredictiveSummary, PipelineError> {
        let records = match &self.scaling {
            Some(scaling) => scaling.scale_all(&grid.times, &grid.latitudes, &grid.longitudes)?,
            None => grid
                .times
                .iter()
                .zip(&grid.latitudes)
                .zip(&grid.longitudes)
                .map(|((&time, &latitude), &longitude)| {
                    Ok(CovariateRecord {
                        time,
                        latitude,
                        longitude: covariates::scale_longitude(longitude)?,
                    })
                })
                .collect::<Result<Vec<_>, CovariateError>>()?,
        };
        self.predict(&records)
    }

    /// Saves the fitted model to a human-readable TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.config.validate()?;
        Ok(model)
    }
}
