use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Design dimensions must be positive: {observations} observations, {terms} terms, {classes} classes.")]
    EmptyDimension {
        observations: usize,
        terms: usize,
        classes: usize,
    },

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Block layout violated at row {row} (class {class}): column {column} lies outside the class block {block_start}..{block_end} but holds {value}."
    )]
    LayoutViolation {
        row: usize,
        class: usize,
        column: usize,
        block_start: usize,
        block_end: usize,
        value: f64,
    },
}

/// Block-diagonal predictor matrix covering every class.
///
/// Rows are interleaved by class: the row for observation `n` and class `c` is
/// `n * K + c`, and it is populated only in columns `c * T..(c + 1) * T`. The
/// multinomial-logit likelihood reads the linear predictors in exactly this
/// order, so any other arrangement yields a wrong posterior without an error.
#[derive(Debug, Clone)]
pub struct BlockDesign {
    matrix: Array2<f64>,
    num_observations: usize,
    num_classes: usize,
    terms_per_class: usize,
}

impl BlockDesign {
    /// Stamps the per-class design matrix `[N, T]` once per class into an
    /// `[N * K, T * K]` block matrix.
    pub fn assemble(per_class: ArrayView2<f64>, num_classes: usize) -> Result<Self, DesignError> {
        let (num_observations, terms_per_class) = per_class.dim();
        if num_observations == 0 || terms_per_class == 0 || num_classes == 0 {
            return Err(DesignError::EmptyDimension {
                observations: num_observations,
                terms: terms_per_class,
                classes: num_classes,
            });
        }

        let mut matrix =
            Array2::zeros((num_observations * num_classes, terms_per_class * num_classes));
        for (n, row) in per_class.rows().into_iter().enumerate() {
            for c in 0..num_classes {
                let cols = c * terms_per_class..(c + 1) * terms_per_class;
                matrix
                    .slice_mut(s![n * num_classes + c, cols])
                    .assign(&row);
            }
        }

        let design = Self {
            matrix,
            num_observations,
            num_classes,
            terms_per_class,
        };
        design.verify_layout()?;
        Ok(design)
    }

    /// Adopts an externally built block matrix after checking its shape and layout.
    pub fn from_dense(
        matrix: Array2<f64>,
        num_classes: usize,
        terms_per_class: usize,
    ) -> Result<Self, DesignError> {
        if num_classes == 0 || terms_per_class == 0 || matrix.nrows() == 0 {
            return Err(DesignError::EmptyDimension {
                observations: matrix.nrows() / num_classes.max(1),
                terms: terms_per_class,
                classes: num_classes,
            });
        }
        if matrix.ncols() != num_classes * terms_per_class {
            return Err(DesignError::DimensionMismatch {
                context: "block design columns",
                expected: num_classes * terms_per_class,
                found: matrix.ncols(),
            });
        }
        if matrix.nrows() % num_classes != 0 {
            return Err(DesignError::DimensionMismatch {
                context: "block design rows (multiple of class count)",
                expected: (matrix.nrows() / num_classes + 1) * num_classes,
                found: matrix.nrows(),
            });
        }
        let design = Self {
            num_observations: matrix.nrows() / num_classes,
            matrix,
            num_classes,
            terms_per_class,
        };
        design.verify_layout()?;
        Ok(design)
    }

    /// Checks that every row is populated only inside its own class block.
    ///
    /// Entries inside a class block are never inspected, so non-finite
    /// covariate values pass through to the density evaluation.
    pub fn verify_layout(&self) -> Result<(), DesignError> {
        for (row, values) in self.matrix.rows().into_iter().enumerate() {
            let class = row % self.num_classes;
            let block = self.column_block(class);
            for (column, &value) in values.iter().enumerate() {
                if !block.contains(&column) && value != 0.0 {
                    return Err(DesignError::LayoutViolation {
                        row,
                        class,
                        column,
                        block_start: block.start,
                        block_end: block.end,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn num_observations(&self) -> usize {
        self.num_observations
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn terms_per_class(&self) -> usize {
        self.terms_per_class
    }

    /// Length of the coefficient vector this design multiplies.
    pub fn parameter_len(&self) -> usize {
        self.num_classes * self.terms_per_class
    }

    pub fn row_index(&self, observation: usize, class: usize) -> usize {
        observation * self.num_classes + class
    }

    pub fn column_block(&self, class: usize) -> Range<usize> {
        class * self.terms_per_class..(class + 1) * self.terms_per_class
    }

    /// Computes `V @ m` after checking the parameter length.
    pub fn apply(&self, params: ArrayView1<f64>) -> Result<Array1<f64>, DesignError> {
        if params.len() != self.parameter_len() {
            return Err(DesignError::DimensionMismatch {
                context: "parameter vector",
                expected: self.parameter_len(),
                found: params.len(),
            });
        }
        Ok(self.matrix.dot(&params))
    }

    /// Linear predictors arranged as `[N, K]`: entry `(n, c)` is row `n * K + c` of `V @ m`.
    pub fn linear_predictors(&self, params: ArrayView1<f64>) -> Result<Array2<f64>, DesignError> {
        let eta = self.apply(params)?;
        Ok(reshape_interleaved(
            eta.view(),
            self.num_observations,
            self.num_classes,
        ))
    }
}

/// Reshapes an interleaved-by-class vector of length `N * K` into `[N, K]`.
pub fn reshape_interleaved(eta: ArrayView1<f64>, observations: usize, classes: usize) -> Array2<f64> {
    Array2::from_shape_fn((observations, classes), |(n, c)| eta[n * classes + c])
}
