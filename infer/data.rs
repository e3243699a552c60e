//! # Data Loading and Writing Module
//!
//! The exclusive entry point for user-provided tables. Training and grid files
//! are tab-separated with a strict header: `time`, `latitude`, `longitude`,
//! plus `label` for training data. Column names are not configurable.
//!
//! Raw values are returned unscaled; `CovariateScaling` owns the mapping into
//! the unit cube. Failures are assumed to be user-input errors and `DataError`
//! reports the offending column and row.

use crate::predictive::PredictiveSummary;
use itertools::izip;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const COVARIATE_COLUMNS: [&str; 3] = ["time", "latitude", "longitude"];
const LABEL_COLUMN: &str = "label";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TSV input: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Column '{column}' holds a non-finite value at data row {row}.")]
    NonFiniteValue { column: &'static str, row: usize },
    #[error("Label {value} at data row {row} is not a non-negative integer.")]
    InvalidLabel { value: f64, row: usize },
    #[error("The input file contains no data rows.")]
    Empty,
    #[error("Summary has {found} points but {expected} covariate rows were supplied.")]
    SummaryMismatch { expected: usize, found: usize },
}

/// Raw covariate columns as read from disk, in physical units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CovariateTable {
    pub times: Vec<f64>,
    pub latitudes: Vec<f64>,
    /// Degrees.
    pub longitudes: Vec<f64>,
}

impl CovariateTable {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    fn push(&mut self, time: f64, latitude: f64, longitude: f64) {
        self.times.push(time);
        self.latitudes.push(latitude);
        self.longitudes.push(longitude);
    }
}

/// Covariates together with their zero-based class labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingTable {
    pub covariates: CovariateTable,
    pub labels: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct GridRow {
    time: f64,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct TrainingRow {
    time: f64,
    latitude: f64,
    longitude: f64,
    label: f64,
}

/// Loads a prediction grid: `time`, `latitude`, `longitude`.
pub fn load_grid_tsv(path: impl AsRef<Path>) -> Result<CovariateTable, DataError> {
    let mut reader = internal::open_tsv(path.as_ref(), &COVARIATE_COLUMNS)?;
    let mut table = CovariateTable::default();
    for (row, record) in reader.deserialize::<GridRow>().enumerate() {
        let record = record?;
        internal::check_finite(&[record.time, record.latitude, record.longitude], row)?;
        table.push(record.time, record.latitude, record.longitude);
    }
    if table.is_empty() {
        return Err(DataError::Empty);
    }
    log::info!(
        "Loaded {} grid points from {}.",
        table.len(),
        path.as_ref().display()
    );
    Ok(table)
}

/// Loads labelled training data: `time`, `latitude`, `longitude`, `label`.
pub fn load_training_tsv(path: impl AsRef<Path>) -> Result<TrainingTable, DataError> {
    let required = [
        COVARIATE_COLUMNS[0],
        COVARIATE_COLUMNS[1],
        COVARIATE_COLUMNS[2],
        LABEL_COLUMN,
    ];
    let mut reader = internal::open_tsv(path.as_ref(), &required)?;
    let mut table = TrainingTable::default();
    for (row, record) in reader.deserialize::<TrainingRow>().enumerate() {
        let record = record?;
        internal::check_finite(&[record.time, record.latitude, record.longitude], row)?;
        table
            .covariates
            .push(record.time, record.latitude, record.longitude);
        table.labels.push(internal::parse_label(record.label, row)?);
    }
    if table.labels.is_empty() {
        return Err(DataError::Empty);
    }
    log::info!(
        "Loaded {} labelled observations from {}.",
        table.labels.len(),
        path.as_ref().display()
    );
    Ok(table)
}

/// Writes one row per grid point: the raw covariates, `mean_c{k}` for every
/// class, then `p{q}_c{k}` for every percentile band.
pub fn write_summary_tsv(
    path: impl AsRef<Path>,
    grid: &CovariateTable,
    summary: &PredictiveSummary,
) -> Result<(), DataError> {
    let (num_classes, num_points) = summary.mean.dim();
    if num_points != grid.len() {
        return Err(DataError::SummaryMismatch {
            expected: grid.len(),
            found: num_points,
        });
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(File::create(path.as_ref())?);

    let mut header: Vec<String> = COVARIATE_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend((0..num_classes).map(|k| format!("mean_c{k}")));
    for band in &summary.bands {
        header.extend((0..num_classes).map(|k| format!("p{}_c{k}", band.percentile)));
    }
    writer.write_record(&header)?;

    for (point, (time, latitude, longitude)) in
        izip!(&grid.times, &grid.latitudes, &grid.longitudes).enumerate()
    {
        let mut fields = vec![time.to_string(), latitude.to_string(), longitude.to_string()];
        fields.extend(summary.mean.column(point).iter().map(|v| v.to_string()));
        for band in &summary.bands {
            fields.extend(band.values.column(point).iter().map(|v| v.to_string()));
        }
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    log::info!(
        "Wrote predictive summary for {} points to {}.",
        num_points,
        path.as_ref().display()
    );
    Ok(())
}

mod internal {
    use super::*;

    pub(super) fn open_tsv(
        path: &Path,
        required: &[&str],
    ) -> Result<csv::Reader<File>, DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);
        let headers = reader.headers()?.clone();
        if let Some(missing) = required
            .iter()
            .find(|column| !headers.iter().any(|h| h == **column))
        {
            return Err(DataError::ColumnNotFound(missing.to_string()));
        }
        Ok(reader)
    }

    pub(super) fn check_finite(values: &[f64; 3], row: usize) -> Result<(), DataError> {
        match values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(DataError::NonFiniteValue {
                column: COVARIATE_COLUMNS[index],
                row,
            }),
            None => Ok(()),
        }
    }

    pub(super) fn parse_label(value: f64, row: usize) -> Result<usize, DataError> {
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
            return Err(DataError::InvalidLabel { value, row });
        }
        Ok(value as usize)
    }
}
