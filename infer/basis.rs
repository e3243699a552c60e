use crate::multi_index::MultiIndexSet;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest magnitude accepted by the Hermite recurrence. Beyond it high-order
/// terms overflow long before the scaled covariates could plausibly reach it.
const HERMITE_STABLE_BOUND: f64 = 1.0e3;

/// Orthogonal polynomial family used for every covariate dimension.
/// This is part of the public API and is saved in the pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolynomialFamily {
    /// Probabilist Hermite polynomials `He_k`, orthogonal under the standard normal.
    #[default]
    ProbabilistHermite,
    /// Legendre polynomials `P_k`, orthogonal on `[-1, 1]`.
    Legendre,
}

impl PolynomialFamily {
    /// Whether `x` lies in the range where the recurrence is evaluated without overflow.
    pub fn is_stable_at(self, x: f64) -> bool {
        if !x.is_finite() {
            return false;
        }
        match self {
            PolynomialFamily::ProbabilistHermite => x.abs() <= HERMITE_STABLE_BOUND,
            PolynomialFamily::Legendre => (-1.0..=1.0).contains(&x),
        }
    }

    /// Evaluates the polynomials of degree `0..=max_degree` at `x`.
    pub fn evaluate_up_to(self, x: f64, max_degree: usize) -> Array1<f64> {
        let mut values = Array1::zeros(max_degree + 1);
        values[0] = 1.0;
        if max_degree == 0 {
            return values;
        }
        values[1] = x;
        for k in 1..max_degree {
            let kf = k as f64;
            values[k + 1] = match self {
                // He_{k+1} = x He_k - k He_{k-1}
                PolynomialFamily::ProbabilistHermite => x * values[k] - kf * values[k - 1],
                // (k+1) P_{k+1} = (2k+1) x P_k - k P_{k-1}
                PolynomialFamily::Legendre => {
                    ((2.0 * kf + 1.0) * x * values[k] - kf * values[k - 1]) / (kf + 1.0)
                }
            };
        }
        values
    }
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Number of covariate dimensions must be at least 1, but was {0}.")]
    InvalidDimension(usize),

    #[error("Maximum total polynomial order must be at least 1, but was {0}.")]
    InvalidOrder(usize),

    #[error("At least one observation is required to build a basis.")]
    NoObservations,

    #[error(
        "Stored terms are not the graded total-order set of order {max_order} over {dims} dimensions."
    )]
    NonCanonicalTerms { dims: usize, max_order: usize },

    #[error(
        "Covariate matrix has {found} rows but the multi-index set expects {expected} dimensions."
    )]
    DimensionMismatch { found: usize, expected: usize },

    #[error(
        "Covariate value {value} (dimension {dimension}, observation {observation}) is outside the stable domain of the {family:?} family."
    )]
    DomainViolation {
        family: PolynomialFamily,
        dimension: usize,
        observation: usize,
        value: f64,
    },
}

/// The evaluated basis together with the term set that defines its column order.
#[derive(Debug, Clone)]
pub struct Vandermonde {
    pub matrix: Array2<f64>,
    pub multi_indices: MultiIndexSet,
}

/// Builds the per-class design matrix for a total-order polynomial basis.
///
/// # Arguments
/// * `covariates`: shape `[D, N]`, one row per covariate dimension.
/// * `max_order`: maximum total degree of any basis term.
/// * `family`: the polynomial family evaluated along every dimension.
///
/// # Returns
/// An `N × |multi-index set|` matrix and the multi-index set that fixes its
/// column order. Keep the set; prediction must reuse it.
pub fn build_vandermonde(
    covariates: ArrayView2<f64>,
    max_order: usize,
    family: PolynomialFamily,
) -> Result<Vandermonde, BasisError> {
    let multi_indices = MultiIndexSet::total_order(covariates.nrows(), max_order)?;
    let matrix = evaluate_basis(covariates, &multi_indices, family)?;
    Ok(Vandermonde {
        matrix,
        multi_indices,
    })
}

/// Evaluates an existing term set at new covariates, with the same column order
/// as the matrix the set was created for.
pub fn evaluate_basis(
    covariates: ArrayView2<f64>,
    multi_indices: &MultiIndexSet,
    family: PolynomialFamily,
) -> Result<Array2<f64>, BasisError> {
    let dims = covariates.nrows();
    let n_obs = covariates.ncols();
    if dims == 0 {
        return Err(BasisError::InvalidDimension(dims));
    }
    if n_obs == 0 {
        return Err(BasisError::NoObservations);
    }
    if dims != multi_indices.dims() {
        return Err(BasisError::DimensionMismatch {
            found: dims,
            expected: multi_indices.dims(),
        });
    }

    // One table per dimension: tables[d][[n, k]] = p_k(x_{d,n}).
    let max_degree = multi_indices.max_degree();
    let tables = covariates
        .rows()
        .into_iter()
        .enumerate()
        .map(|(dimension, row)| internal::univariate_table(row, dimension, max_degree, family))
        .collect::<Result<Vec<_>, _>>()?;

    let mut matrix = Array2::ones((n_obs, multi_indices.len()));
    for (col, index) in multi_indices.iter().enumerate() {
        for (table, &degree) in tables.iter().zip(index) {
            if degree == 0 {
                continue;
            }
            let mut column = matrix.column_mut(col);
            column *= &table.column(degree);
        }
    }

    Ok(matrix)
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn univariate_table(
        values: ArrayView1<f64>,
        dimension: usize,
        max_degree: usize,
        family: PolynomialFamily,
    ) -> Result<Array2<f64>, BasisError> {
        let mut table = Array2::zeros((values.len(), max_degree + 1));
        for (observation, &x) in values.iter().enumerate() {
            if !family.is_stable_at(x) {
                return Err(BasisError::DomainViolation {
                    family,
                    dimension,
                    observation,
                    value: x,
                });
            }
            table
                .row_mut(observation)
                .assign(&family.evaluate_up_to(x, max_degree));
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_hermite_recurrence_values() {
        // He_2 = x^2 - 1, He_3 = x^3 - 3x, He_4 = x^4 - 6x^2 + 3
        let x = 0.7_f64;
        let he = PolynomialFamily::ProbabilistHermite.evaluate_up_to(x, 4);
        assert_abs_diff_eq!(he[0], 1.0);
        assert_abs_diff_eq!(he[1], x);
        assert_abs_diff_eq!(he[2], x * x - 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(he[3], x.powi(3) - 3.0 * x, epsilon = 1e-12);
        assert_abs_diff_eq!(he[4], x.powi(4) - 6.0 * x * x + 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_legendre_recurrence_values() {
        // P_2 = (3x^2 - 1)/2, P_3 = (5x^3 - 3x)/2
        let x = -0.4_f64;
        let p = PolynomialFamily::Legendre.evaluate_up_to(x, 3);
        assert_abs_diff_eq!(p[2], 0.5 * (3.0 * x * x - 1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(p[3], 0.5 * (5.0 * x.powi(3) - 3.0 * x), epsilon = 1e-12);
    }

    #[test]
    fn test_shape_matches_multi_index_set() {
        let covariates = array![[0.0, 0.2, 0.5, 1.0], [0.3, 0.3, 0.9, 0.1], [1.0, 0.0, 0.5, 0.5]];
        for order in 1..=4 {
            let basis = build_vandermonde(
                covariates.view(),
                order,
                PolynomialFamily::ProbabilistHermite,
            )
            .unwrap();
            assert_eq!(basis.matrix.nrows(), 4);
            assert_eq!(basis.matrix.ncols(), basis.multi_indices.len());
        }
    }

    #[test]
    fn test_order_one_single_dimension_is_affine() {
        let covariates = array![[0.0, 0.25, 0.75, 1.0]];
        let basis = build_vandermonde(
            covariates.view(),
            1,
            PolynomialFamily::ProbabilistHermite,
        )
        .unwrap();
        assert_eq!(
            basis.matrix,
            array![[1.0, 0.0], [1.0, 0.25], [1.0, 0.75], [1.0, 1.0]]
        );
    }

    #[test]
    fn test_tensor_product_terms() {
        // Terms for (2 dims, order 2): 1, x, y, He2(x), x*y, He2(y)
        let covariates = array![[0.5], [2.0]];
        let basis = build_vandermonde(
            covariates.view(),
            2,
            PolynomialFamily::ProbabilistHermite,
        )
        .unwrap();
        let row = basis.matrix.row(0);
        let expected = [1.0, 0.5, 2.0, 0.25 - 1.0, 1.0, 4.0 - 1.0];
        for (got, want) in row.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rejects_non_finite_covariates() {
        let covariates = array![[0.1, f64::NAN, 0.3]];
        match build_vandermonde(covariates.view(), 2, PolynomialFamily::ProbabilistHermite)
            .unwrap_err()
        {
            BasisError::DomainViolation {
                dimension,
                observation,
                ..
            } => {
                assert_eq!(dimension, 0);
                assert_eq!(observation, 1);
            }
            other => panic!("Expected DomainViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_legendre_rejects_values_outside_unit_interval() {
        let covariates = array![[0.5, 1.5]];
        assert!(matches!(
            build_vandermonde(covariates.view(), 1, PolynomialFamily::Legendre),
            Err(BasisError::DomainViolation { observation: 1, .. })
        ));
    }

    #[test]
    fn test_error_conditions() {
        let empty_obs = Array2::<f64>::zeros((2, 0));
        assert!(matches!(
            build_vandermonde(empty_obs.view(), 2, PolynomialFamily::ProbabilistHermite),
            Err(BasisError::NoObservations)
        ));

        let empty_dims = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            build_vandermonde(empty_dims.view(), 2, PolynomialFamily::ProbabilistHermite),
            Err(BasisError::InvalidDimension(0))
        ));

        let covariates = array![[0.1, 0.2]];
        assert!(matches!(
            build_vandermonde(covariates.view(), 0, PolynomialFamily::ProbabilistHermite),
            Err(BasisError::InvalidOrder(0))
        ));

        let set = MultiIndexSet::total_order(3, 2).unwrap();
        assert!(matches!(
            evaluate_basis(covariates.view(), &set, PolynomialFamily::ProbabilistHermite),
            Err(BasisError::DimensionMismatch {
                found: 1,
                expected: 3
            })
        ));
    }
}
