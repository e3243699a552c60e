use crate::basis::PolynomialFamily;
use crate::sampler::{SamplerConfig, SamplerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML layout of a pipeline run.
// Every stage receives its section by reference; nothing is global.

/// Structure of the regression model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Number of output classes (3 for no-ice, first-year, multiyear).
    pub num_classes: usize,
    /// Maximum total degree of the polynomial basis.
    pub max_order: usize,
    pub family: PolynomialFamily,
    /// Variance of the isotropic zero-mean Gaussian prior on every coefficient.
    pub prior_variance: f64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            num_classes: 3,
            max_order: 3,
            family: PolynomialFamily::ProbabilistHermite,
            prior_variance: 100.0,
        }
    }
}

/// Posterior-predictive settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionSpec {
    /// Leading iterations of every chain discarded before aggregation.
    pub burn_in: usize,
    /// Percentiles reported alongside the mean, each in `[0, 100]`.
    pub percentiles: Vec<f64>,
}

impl Default for PredictionSpec {
    fn default() -> Self {
        Self {
            burn_in: 5_000,
            percentiles: vec![1.0, 99.0],
        }
    }
}

/// The complete, immutable configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelSpec,
    pub sampler: SamplerConfig,
    pub prediction: PredictionSpec,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid sampler section: {0}")]
    Sampler(#[from] SamplerError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    /// Fails fast on values no stage could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.num_classes < 2 {
            return Err(ConfigError::Invalid(format!(
                "model.num_classes must be at least 2, got {}",
                self.model.num_classes
            )));
        }
        if self.model.max_order == 0 {
            return Err(ConfigError::Invalid(
                "model.max_order must be at least 1".to_string(),
            ));
        }
        if !self.model.prior_variance.is_finite() || self.model.prior_variance <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "model.prior_variance must be finite and positive, got {}",
                self.model.prior_variance
            )));
        }
        self.sampler.validate()?;
        if self.prediction.burn_in >= self.sampler.num_samples {
            return Err(ConfigError::Invalid(format!(
                "prediction.burn_in ({}) leaves no samples out of sampler.num_samples ({})",
                self.prediction.burn_in, self.sampler.num_samples
            )));
        }
        if let Some(bad) = self
            .prediction
            .percentiles
            .iter()
            .find(|q| !(0.0..=100.0).contains(*q))
        {
            return Err(ConfigError::Invalid(format!(
                "prediction.percentiles entry {bad} is outside [0, 100]"
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
