use crate::density::{
    DensityGraph, GaussianCovariance, GaussianDensity, GraphError, LinearMap, MultinomialLogit,
    Node, NodeId,
};
use crate::design::{BlockDesign, DesignError};
use crate::sampler::LogDensity;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Design error while composing the posterior: {0}")]
    Design(#[from] DesignError),

    #[error("Density graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Dimension mismatch for {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Zero-mean Gaussian prior over the full coefficient vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GaussianPrior {
    /// `N(0, variance * I)`.
    Isotropic { dim: usize, variance: f64 },
    /// `N(0, diag(variances))`.
    Diagonal { variances: Vec<f64> },
}

impl GaussianPrior {
    pub fn isotropic(dim: usize, variance: f64) -> Self {
        GaussianPrior::Isotropic { dim, variance }
    }

    pub fn diagonal(variances: Vec<f64>) -> Self {
        GaussianPrior::Diagonal { variances }
    }

    pub fn dim(&self) -> usize {
        match self {
            GaussianPrior::Isotropic { dim, .. } => *dim,
            GaussianPrior::Diagonal { variances } => variances.len(),
        }
    }

    fn density(&self) -> Result<GaussianDensity, GraphError> {
        let variances = match self {
            GaussianPrior::Isotropic { dim, variance } => Array1::from_elem(*dim, *variance),
            GaussianPrior::Diagonal { variances } => Array1::from_vec(variances.clone()),
        };
        GaussianDensity::new(
            Array1::zeros(variances.len()),
            GaussianCovariance::Diagonal(variances),
        )
    }
}

/// Handles of the five nodes that make up the posterior.
#[derive(Debug, Clone, Copy)]
struct PosteriorNodes {
    parameters: NodeId,
    prior: NodeId,
    forward: NodeId,
    likelihood: NodeId,
    posterior: NodeId,
}

/// Posterior over the multinomial-logit coefficients.
///
/// ```text
///   Parameters ──► Prior ───────────────────────┐
///        │                                       ├──► Posterior (sum)
///        └──────► ForwardModel ──► Likelihood ───┘
/// ```
///
/// Evaluation is a pure function of the coefficient vector.
#[derive(Debug, Clone)]
pub struct PosteriorModel {
    graph: DensityGraph,
    nodes: PosteriorNodes,
    dim: usize,
    num_classes: usize,
    num_observations: usize,
}

impl PosteriorModel {
    /// Wires prior, forward model and likelihood into a single posterior.
    ///
    /// # Arguments
    /// * `design`: the block design matrix of the training observations.
    /// * `labels`: one class label per observation, in observation order.
    /// * `prior`: the Gaussian prior; its dimension must equal `design.parameter_len()`.
    pub fn compose(
        design: &BlockDesign,
        labels: ArrayView1<usize>,
        prior: &GaussianPrior,
    ) -> Result<Self, ModelError> {
        design.verify_layout()?;
        if labels.len() != design.num_observations() {
            return Err(ModelError::DimensionMismatch {
                context: "label count vs. design observations",
                expected: design.num_observations(),
                found: labels.len(),
            });
        }
        let dim = design.parameter_len();
        if prior.dim() != dim {
            return Err(ModelError::DimensionMismatch {
                context: "prior dimension vs. parameter length",
                expected: dim,
                found: prior.dim(),
            });
        }

        let prior_density = prior.density()?;
        let forward = LinearMap::new(design.matrix().to_owned());
        let likelihood = MultinomialLogit::new(labels.to_owned(), design.num_classes())?;

        let mut graph = DensityGraph::new();
        let parameters = graph.add_node(Node::Parameters { dim });
        let prior_node = graph.add_node(Node::Gaussian(prior_density));
        let forward_node = graph.add_node(Node::LinearMap(forward));
        let likelihood_node = graph.add_node(Node::MultinomialLogit(likelihood));
        let posterior = graph.add_node(Node::Sum { arity: 2 });

        graph.connect(parameters, 0, prior_node, 0)?;
        graph.connect(parameters, 0, forward_node, 0)?;
        graph.connect(forward_node, 0, likelihood_node, 0)?;
        graph.connect(prior_node, 0, posterior, 0)?;
        graph.connect(likelihood_node, 0, posterior, 1)?;
        graph.validate()?;

        log::debug!(
            "Composed posterior over {} coefficients ({} classes x {} terms, {} observations).",
            dim,
            design.num_classes(),
            design.terms_per_class(),
            design.num_observations()
        );

        Ok(Self {
            graph,
            nodes: PosteriorNodes {
                parameters,
                prior: prior_node,
                forward: forward_node,
                likelihood: likelihood_node,
                posterior,
            },
            dim,
            num_classes: design.num_classes(),
            num_observations: design.num_observations(),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_observations(&self) -> usize {
        self.num_observations
    }

    pub fn graph(&self) -> &DensityGraph {
        &self.graph
    }

    /// Node id of the posterior sum, for callers walking the graph themselves.
    pub fn posterior_node(&self) -> NodeId {
        self.nodes.posterior
    }

    fn check_len(&self, m: ArrayView1<f64>) -> Result<(), ModelError> {
        if m.len() != self.dim {
            return Err(ModelError::DimensionMismatch {
                context: "parameter vector",
                expected: self.dim,
                found: m.len(),
            });
        }
        Ok(())
    }

    /// Full graph evaluation: `prior(m) + likelihood(V @ m, y)`.
    pub fn log_density(&self, m: ArrayView1<f64>) -> Result<f64, ModelError> {
        self.check_len(m)?;
        let values = self.graph.evaluate(m)?;
        debug_assert!(values.vector(self.nodes.parameters).is_some());
        Ok(values
            .log_density(self.nodes.posterior)
            .unwrap_or(f64::NEG_INFINITY))
    }

    pub fn prior_log_density(&self, m: ArrayView1<f64>) -> Result<f64, ModelError> {
        let (prior, _, _) = self.log_density_parts(m)?;
        Ok(prior)
    }

    /// Multinomial-logit log-probability of the training labels at `V @ m`.
    pub fn likelihood_log_density(&self, m: ArrayView1<f64>) -> Result<f64, ModelError> {
        let (_, likelihood, _) = self.log_density_parts(m)?;
        Ok(likelihood)
    }

    /// All three densities from one graph pass, as `(prior, likelihood, posterior)`.
    pub fn log_density_parts(&self, m: ArrayView1<f64>) -> Result<(f64, f64, f64), ModelError> {
        self.check_len(m)?;
        let values = self.graph.evaluate(m)?;
        let read = |node: NodeId| values.log_density(node).unwrap_or(f64::NEG_INFINITY);
        debug_assert!(values.vector(self.nodes.forward).is_some());
        Ok((
            read(self.nodes.prior),
            read(self.nodes.likelihood),
            read(self.nodes.posterior),
        ))
    }
}

impl LogDensity for PosteriorModel {
    fn dim(&self) -> usize {
        self.dim
    }

    /// Shape errors cannot occur for vectors of the right length; anything
    /// else is reported as an impossible state, i.e. `-inf`.
    fn log_density(&self, m: ArrayView1<f64>) -> f64 {
        match PosteriorModel::log_density(self, m) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Posterior evaluation failed, rejecting state: {e}");
                f64::NEG_INFINITY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::f64::consts::PI;

    fn toy_model() -> PosteriorModel {
        // Order-one basis [1, x] at x = [0, 0.25, 0.75, 1], two classes.
        let per_class = array![[1.0, 0.0], [1.0, 0.25], [1.0, 0.75], [1.0, 1.0]];
        let design = BlockDesign::assemble(per_class.view(), 2).unwrap();
        let labels = array![0usize, 1, 0, 1];
        PosteriorModel::compose(&design, labels.view(), &GaussianPrior::isotropic(4, 100.0))
            .unwrap()
    }

    #[test]
    fn test_posterior_is_prior_plus_likelihood() {
        let model = toy_model();
        for m in [
            array![0.0, 0.0, 0.0, 0.0],
            array![0.3, -1.2, 2.0, 0.7],
            array![-5.0, 4.0, 1.5, -0.25],
        ] {
            let total = model.log_density(m.view()).unwrap();
            let prior = model.prior_log_density(m.view()).unwrap();
            let likelihood = model.likelihood_log_density(m.view()).unwrap();
            assert_eq!(total, prior + likelihood);

            let (p, l, t) = model.log_density_parts(m.view()).unwrap();
            assert_eq!((p, l, t), (prior, likelihood, total));
        }
    }

    #[test]
    fn test_zero_coefficients_give_uniform_likelihood() {
        let model = toy_model();
        let zero = Array1::zeros(4);
        let likelihood = model.likelihood_log_density(zero.view()).unwrap();
        assert_abs_diff_eq!(likelihood, 4.0 * 0.5_f64.ln(), epsilon = 1e-12);
        let prior = model.prior_log_density(zero.view()).unwrap();
        assert_abs_diff_eq!(prior, -2.0 * (2.0 * PI * 100.0).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            model.log_density(zero.view()).unwrap(),
            prior + 4.0 * 0.5_f64.ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_evaluation_is_repeatable() {
        let model = toy_model();
        let m = array![0.1, 0.2, -0.3, 0.4];
        let first = model.log_density(m.view()).unwrap();
        for _ in 0..5 {
            assert_eq!(model.log_density(m.view()).unwrap(), first);
        }
    }

    #[test]
    fn test_non_finite_design_is_rejected_not_crashed() {
        let per_class = array![[1.0, f64::NAN], [1.0, 0.5]];
        let design = BlockDesign::assemble(per_class.view(), 2).unwrap();
        let model = PosteriorModel::compose(
            &design,
            array![0usize, 1].view(),
            &GaussianPrior::isotropic(4, 1.0),
        )
        .unwrap();
        let value = model.log_density(array![0.1, 0.1, 0.1, 0.1].view()).unwrap();
        assert_eq!(value, f64::NEG_INFINITY);
    }

    #[test]
    fn test_dimension_checks() {
        let per_class = array![[1.0, 0.0], [1.0, 1.0]];
        let design = BlockDesign::assemble(per_class.view(), 2).unwrap();
        assert!(matches!(
            PosteriorModel::compose(
                &design,
                array![0usize].view(),
                &GaussianPrior::isotropic(4, 1.0)
            ),
            Err(ModelError::DimensionMismatch { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            PosteriorModel::compose(
                &design,
                array![0usize, 1].view(),
                &GaussianPrior::isotropic(3, 1.0)
            ),
            Err(ModelError::DimensionMismatch { expected: 4, found: 3, .. })
        ));
        assert!(matches!(
            PosteriorModel::compose(
                &design,
                array![0usize, 2].view(),
                &GaussianPrior::isotropic(4, 1.0)
            ),
            Err(ModelError::Graph(GraphError::InvalidNode { .. }))
        ));

        let model = PosteriorModel::compose(
            &design,
            array![0usize, 1].view(),
            &GaussianPrior::diagonal(vec![1.0, 2.0, 3.0, 4.0]),
        )
        .unwrap();
        assert!(matches!(
            model.log_density(array![0.0, 0.0].view()),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }
}
