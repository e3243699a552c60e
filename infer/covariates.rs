//! # Covariate Scaling
//!
//! Every covariate entering the basis lives on `[0, 1]`:
//!
//! - Time and latitude are min-max scaled against ranges fixed at training
//!   time and can be mapped back with `unscale_*`.
//! - Longitude (degrees) is folded through `(1 + cos(lon)) / 2`. The fold is
//!   periodic and not injective, so no inverse exists.
//!
//! The ranges are part of the fitted model: prediction grids are scaled with
//! the training ranges, never with their own.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of covariate dimensions in a record: time, latitude, longitude.
pub const NUM_COVARIATES: usize = 3;

/// Slack allowed outside `[0, 1]` before a scaled value counts as a domain violation.
const BOUNDARY_SLACK: f64 = 1.0e-12;

const COVARIATE_NAMES: [&str; NUM_COVARIATES] = ["time", "latitude", "longitude"];

#[derive(Error, Debug)]
pub enum CovariateError {
    #[error("Cannot derive a scaling range for '{name}': min {min} and max {max} do not span a finite, non-empty interval.")]
    DegenerateRange { name: &'static str, min: f64, max: f64 },

    #[error("Raw {name} value {value} scales to {scaled}, outside [0, 1]. Prediction inputs must lie within the training range.")]
    OutOfRange {
        name: &'static str,
        value: f64,
        scaled: f64,
    },

    #[error("Non-finite raw {name} value at row {row}.")]
    NonFinite { name: &'static str, row: usize },

    #[error("Parallel arrays disagree in length: {name} has {found} entries, expected {expected}.")]
    DimensionMismatch {
        name: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("Observation {index} has class label {label}, but the model has only {num_classes} classes.")]
    LabelOutOfRange {
        index: usize,
        label: usize,
        num_classes: usize,
    },

    #[error("At least one observation is required.")]
    Empty,
}

impl CovariateError {
    fn at_row(self, row: usize) -> Self {
        match self {
            CovariateError::NonFinite { name, .. } => CovariateError::NonFinite { name, row },
            other => other,
        }
    }
}

/// One scaled covariate tuple. All components lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovariateRecord {
    pub time: f64,
    pub latitude: f64,
    pub longitude: f64,
}

impl CovariateRecord {
    pub fn as_array(&self) -> [f64; NUM_COVARIATES] {
        [self.time, self.latitude, self.longitude]
    }

    /// Checks that every component is finite and lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), CovariateError> {
        for (name, value) in COVARIATE_NAMES.into_iter().zip(self.as_array()) {
            if !value.is_finite() {
                return Err(CovariateError::NonFinite { name, row: 0 });
            }
            if !(-BOUNDARY_SLACK..=1.0 + BOUNDARY_SLACK).contains(&value) {
                return Err(CovariateError::OutOfRange {
                    name,
                    value,
                    scaled: value,
                });
            }
        }
        Ok(())
    }
}

/// Validates scaled records, reporting the first offending row.
pub fn check_records(records: &[CovariateRecord]) -> Result<(), CovariateError> {
    records
        .iter()
        .enumerate()
        .try_for_each(|(row, record)| record.validate().map_err(|e| e.at_row(row)))
}

/// A labelled observation. Immutable once loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub covariates: CovariateRecord,
    pub label: usize,
}

/// The min-max ranges used to scale raw time and latitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovariateScaling {
    pub time_range: (f64, f64),
    pub latitude_range: (f64, f64),
}

impl CovariateScaling {
    pub fn new(time_range: (f64, f64), latitude_range: (f64, f64)) -> Result<Self, CovariateError> {
        internal::check_range("time", time_range)?;
        internal::check_range("latitude", latitude_range)?;
        Ok(Self {
            time_range,
            latitude_range,
        })
    }

    /// Derives the ranges from raw training data.
    pub fn fit(times: &[f64], latitudes: &[f64]) -> Result<Self, CovariateError> {
        Self::new(
            internal::finite_range("time", times)?,
            internal::finite_range("latitude", latitudes)?,
        )
    }

    pub fn scale_time(&self, time: f64) -> Result<f64, CovariateError> {
        internal::min_max("time", time, self.time_range)
    }

    pub fn unscale_time(&self, scaled: f64) -> f64 {
        let (lo, hi) = self.time_range;
        lo + scaled * (hi - lo)
    }

    pub fn scale_latitude(&self, latitude: f64) -> Result<f64, CovariateError> {
        internal::min_max("latitude", latitude, self.latitude_range)
    }

    pub fn unscale_latitude(&self, scaled: f64) -> f64 {
        let (lo, hi) = self.latitude_range;
        lo + scaled * (hi - lo)
    }

    /// Scales one raw `(time, latitude, longitude_degrees)` triple.
    pub fn scale(
        &self,
        time: f64,
        latitude: f64,
        longitude: f64,
    ) -> Result<CovariateRecord, CovariateError> {
        Ok(CovariateRecord {
            time: self.scale_time(time)?,
            latitude: self.scale_latitude(latitude)?,
            longitude: scale_longitude(longitude)?,
        })
    }

    /// Scales parallel raw arrays into records.
    pub fn scale_all(
        &self,
        times: &[f64],
        latitudes: &[f64],
        longitudes: &[f64],
    ) -> Result<Vec<CovariateRecord>, CovariateError> {
        internal::check_len("latitude", latitudes.len(), times.len())?;
        internal::check_len("longitude", longitudes.len(), times.len())?;
        times
            .iter()
            .zip(latitudes)
            .zip(longitudes)
            .enumerate()
            .map(|(row, ((&t, &lat), &lon))| {
                self.scale(t, lat, lon).map_err(|e| e.at_row(row))
            })
            .collect()
    }
}

/// Periodic longitude fold, `(1 + cos(lon)) / 2` with `lon` in degrees.
pub fn scale_longitude(longitude_degrees: f64) -> Result<f64, CovariateError> {
    if !longitude_degrees.is_finite() {
        return Err(CovariateError::NonFinite {
            name: "longitude",
            row: 0,
        });
    }
    Ok(0.5 * (1.0 + longitude_degrees.to_radians().cos()))
}

/// Validated observations with covariates stored column-wise for the basis builder.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    records: Vec<CovariateRecord>,
    labels: Array1<usize>,
    num_classes: usize,
}

impl ObservationSet {
    pub fn new(
        records: Vec<CovariateRecord>,
        labels: Vec<usize>,
        num_classes: usize,
    ) -> Result<Self, CovariateError> {
        if records.is_empty() {
            return Err(CovariateError::Empty);
        }
        internal::check_len("labels", labels.len(), records.len())?;
        check_records(&records)?;
        if let Some((index, &label)) = labels
            .iter()
            .enumerate()
            .find(|(_, label)| **label >= num_classes)
        {
            return Err(CovariateError::LabelOutOfRange {
                index,
                label,
                num_classes,
            });
        }
        Ok(Self {
            records,
            labels: Array1::from_vec(labels),
            num_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> &Array1<usize> {
        &self.labels
    }

    pub fn records(&self) -> &[CovariateRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = Observation> + '_ {
        self.records
            .iter()
            .zip(self.labels.iter())
            .map(|(&covariates, &label)| Observation { covariates, label })
    }

    /// Covariates as a `[3, N]` matrix, rows in the order time, latitude, longitude.
    pub fn covariate_matrix(&self) -> Array2<f64> {
        covariate_matrix(&self.records)
    }
}

/// Stacks records into a `[3, N]` matrix, rows in the order time, latitude, longitude.
pub fn covariate_matrix(records: &[CovariateRecord]) -> Array2<f64> {
    let mut matrix = Array2::zeros((NUM_COVARIATES, records.len()));
    for (n, record) in records.iter().enumerate() {
        for (d, value) in record.as_array().into_iter().enumerate() {
            matrix[[d, n]] = value;
        }
    }
    matrix
}

mod internal {
    use super::*;

    pub(super) fn check_range(name: &'static str, range: (f64, f64)) -> Result<(), CovariateError> {
        let (min, max) = range;
        if !min.is_finite() || !max.is_finite() || max <= min {
            return Err(CovariateError::DegenerateRange { name, min, max });
        }
        Ok(())
    }

    pub(super) fn check_len(
        name: &'static str,
        found: usize,
        expected: usize,
    ) -> Result<(), CovariateError> {
        if found != expected {
            return Err(CovariateError::DimensionMismatch {
                name,
                found,
                expected,
            });
        }
        Ok(())
    }

    pub(super) fn finite_range(
        name: &'static str,
        values: &[f64],
    ) -> Result<(f64, f64), CovariateError> {
        if values.is_empty() {
            return Err(CovariateError::Empty);
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (row, &v) in values.iter().enumerate() {
            if !v.is_finite() {
                return Err(CovariateError::NonFinite { name, row });
            }
            min = min.min(v);
            max = max.max(v);
        }
        Ok((min, max))
    }

    pub(super) fn min_max(
        name: &'static str,
        value: f64,
        range: (f64, f64),
    ) -> Result<f64, CovariateError> {
        if !value.is_finite() {
            return Err(CovariateError::NonFinite { name, row: 0 });
        }
        let (lo, hi) = range;
        let scaled = (value - lo) / (hi - lo);
        if !(-BOUNDARY_SLACK..=1.0 + BOUNDARY_SLACK).contains(&scaled) {
            return Err(CovariateError::OutOfRange {
                name,
                value,
                scaled,
            });
        }
        Ok(scaled.clamp(0.0, 1.0))
    }
}
