//! # Density Graph
//!
//! A posterior is assembled as a small directed acyclic graph of density and
//! transform nodes. Every node kind is a variant of [`Node`]; edges connect a
//! typed output slot of one node to a typed input slot of another. Evaluation
//! walks the nodes once in topological order and is a pure function of the
//! parameter vector fed into the `Parameters` nodes.
//!
//! Log densities that come out non-finite are reported as `-inf`, which a
//! Metropolis sampler treats as an automatic rejection.

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};
use std::collections::VecDeque;
use std::f64::consts::PI;
use thiserror::Error;

pub type NodeId = usize;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Node {0} does not exist in the graph.")]
    UnknownNode(NodeId),

    #[error("Node {node} ({name}) has no {direction} slot {slot}.")]
    UnknownSlot {
        node: NodeId,
        name: &'static str,
        direction: &'static str,
        slot: usize,
    },

    #[error("Cannot connect a {from:?} output to a {to:?} input.")]
    SlotKindMismatch { from: SlotKind, to: SlotKind },

    #[error("Input slot {slot} of node {node} is already connected.")]
    SlotOccupied { node: NodeId, slot: usize },

    #[error("Input slot {slot} of node {node} ({name}) is not connected.")]
    UnconnectedInput {
        node: NodeId,
        name: &'static str,
        slot: usize,
    },

    #[error("A node cannot feed itself (node {0}).")]
    SelfLoop(NodeId),

    #[error("The density graph contains a cycle.")]
    Cycle,

    #[error("Dimension mismatch at node {node} ({name}): expected {expected}, found {found}.")]
    DimensionMismatch {
        node: NodeId,
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Node {node} ({name}) has an invalid configuration: {reason}")]
    InvalidNode {
        node: NodeId,
        name: &'static str,
        reason: String,
    },

    #[error("Covariance factorization failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// What travels along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Vector,
    LogDensity,
}

/// The value produced on a node's output slot.
#[derive(Debug, Clone)]
pub enum Value {
    Vector(Array1<f64>),
    LogDensity(f64),
}

/// Covariance of a Gaussian density node.
#[derive(Debug, Clone)]
pub enum GaussianCovariance {
    /// Independent components with the given variances.
    Diagonal(Array1<f64>),
    /// A dense symmetric positive-definite covariance.
    Full(Array2<f64>),
}

/// A multivariate normal log-density with its normalizing constant precomputed.
#[derive(Debug, Clone)]
pub struct GaussianDensity {
    mean: Array1<f64>,
    factor: CovarianceFactor,
    log_normalizer: f64,
}

#[derive(Debug, Clone)]
enum CovarianceFactor {
    /// Reciprocal variances.
    Diagonal(Array1<f64>),
    /// Lower Cholesky factor `L` with `L L^T = Σ`.
    Cholesky(Array2<f64>),
}

impl GaussianDensity {
    pub fn new(mean: Array1<f64>, covariance: GaussianCovariance) -> Result<Self, GraphError> {
        let dim = mean.len();
        let invalid = |reason: String| GraphError::InvalidNode {
            node: 0,
            name: "Gaussian",
            reason,
        };
        if dim == 0 {
            return Err(invalid("dimension must be positive".to_string()));
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(invalid("mean must be finite".to_string()));
        }

        let (factor, log_det) = match covariance {
            GaussianCovariance::Diagonal(variances) => {
                if variances.len() != dim {
                    return Err(GraphError::DimensionMismatch {
                        node: 0,
                        name: "Gaussian",
                        expected: dim,
                        found: variances.len(),
                    });
                }
                if variances.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                    return Err(invalid("variances must be finite and positive".to_string()));
                }
                let log_det = variances.iter().map(|v| v.ln()).sum::<f64>();
                (CovarianceFactor::Diagonal(variances.mapv(f64::recip)), log_det)
            }
            GaussianCovariance::Full(covariance) => {
                if covariance.dim() != (dim, dim) {
                    return Err(GraphError::DimensionMismatch {
                        node: 0,
                        name: "Gaussian",
                        expected: dim,
                        found: covariance.nrows(),
                    });
                }
                let lower = covariance.cholesky(UPLO::Lower)?;
                let log_det = 2.0 * lower.diag().iter().map(|d| d.ln()).sum::<f64>();
                (CovarianceFactor::Cholesky(lower), log_det)
            }
        };

        let log_normalizer = -0.5 * (dim as f64 * (2.0 * PI).ln() + log_det);
        Ok(Self {
            mean,
            factor,
            log_normalizer,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Log-density at `x`. The caller guarantees `x.len() == self.dim()`.
    pub fn log_density(&self, x: ArrayView1<f64>) -> Result<f64, GraphError> {
        let centered = &x - &self.mean;
        let quadratic = match &self.factor {
            CovarianceFactor::Diagonal(precision) => centered
                .iter()
                .zip(precision.iter())
                .map(|(r, p)| r * r * p)
                .sum::<f64>(),
            CovarianceFactor::Cholesky(lower) => {
                let whitened = lower.solve_triangular(UPLO::Lower, Diag::NonUnit, &centered)?;
                whitened.dot(&whitened)
            }
        };
        Ok(finite_or_reject(self.log_normalizer - 0.5 * quadratic))
    }
}

/// Linear transform `y = A x`.
#[derive(Debug, Clone)]
pub struct LinearMap {
    matrix: Array2<f64>,
}

impl LinearMap {
    pub fn new(matrix: Array2<f64>) -> Self {
        Self { matrix }
    }

    pub fn input_dim(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.matrix.dot(&x)
    }
}

/// Log-probability of observed class labels under softmax class probabilities.
///
/// The input vector holds the linear predictors interleaved by class: entry
/// `n * K + c` is the predictor of class `c` for observation `n`.
#[derive(Debug, Clone)]
pub struct MultinomialLogit {
    labels: Array1<usize>,
    num_classes: usize,
}

impl MultinomialLogit {
    pub fn new(labels: Array1<usize>, num_classes: usize) -> Result<Self, GraphError> {
        if num_classes == 0 || labels.is_empty() {
            return Err(GraphError::InvalidNode {
                node: 0,
                name: "MultinomialLogit",
                reason: "needs at least one class and one observation".to_string(),
            });
        }
        if let Some(bad) = labels.iter().find(|&&y| y >= num_classes) {
            return Err(GraphError::InvalidNode {
                node: 0,
                name: "MultinomialLogit",
                reason: format!("label {bad} is not below the class count {num_classes}"),
            });
        }
        Ok(Self {
            labels,
            num_classes,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.labels.len() * self.num_classes
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `sum_n log softmax(eta_n)[y_n]`, computed with a shifted log-sum-exp.
    pub fn log_density(&self, eta: ArrayView1<f64>) -> f64 {
        let k = self.num_classes;
        let mut total = 0.0;
        for (n, &label) in self.labels.iter().enumerate() {
            let block = eta.slice(ndarray::s![n * k..(n + 1) * k]);
            total += block[label] - log_sum_exp(block);
        }
        finite_or_reject(total)
    }
}

/// `log(sum(exp(v)))` with the maximum subtracted first.
pub fn log_sum_exp(values: ArrayView1<f64>) -> f64 {
    let max = values.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Maps any non-finite log-density to `-inf`.
pub fn finite_or_reject(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        f64::NEG_INFINITY
    }
}

/// The node kinds a density graph can hold.
#[derive(Debug, Clone)]
pub enum Node {
    /// Pass-through of the graph's parameter vector.
    Parameters { dim: usize },
    Gaussian(GaussianDensity),
    LinearMap(LinearMap),
    MultinomialLogit(MultinomialLogit),
    /// Product of densities: the sum of `arity` log-densities.
    Sum { arity: usize },
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::Parameters { .. } => "Parameters",
            Node::Gaussian(_) => "Gaussian",
            Node::LinearMap(_) => "LinearMap",
            Node::MultinomialLogit(_) => "MultinomialLogit",
            Node::Sum { .. } => "Sum",
        }
    }

    pub fn input_slots(&self) -> Vec<SlotKind> {
        match self {
            Node::Parameters { .. } => Vec::new(),
            Node::Gaussian(_) | Node::LinearMap(_) | Node::MultinomialLogit(_) => {
                vec![SlotKind::Vector]
            }
            Node::Sum { arity } => vec![SlotKind::LogDensity; *arity],
        }
    }

    pub fn output_slots(&self) -> Vec<SlotKind> {
        match self {
            Node::Parameters { .. } | Node::LinearMap(_) => vec![SlotKind::Vector],
            Node::Gaussian(_) | Node::MultinomialLogit(_) | Node::Sum { .. } => {
                vec![SlotKind::LogDensity]
            }
        }
    }

    fn evaluate(
        &self,
        id: NodeId,
        params: ArrayView1<f64>,
        inputs: &[&Value],
    ) -> Result<Value, GraphError> {
        let check = |expected: usize, found: usize| {
            if expected == found {
                Ok(())
            } else {
                Err(GraphError::DimensionMismatch {
                    node: id,
                    name: self.name(),
                    expected,
                    found,
                })
            }
        };

        match self {
            Node::Parameters { dim } => {
                check(*dim, params.len())?;
                Ok(Value::Vector(params.to_owned()))
            }
            Node::Gaussian(density) => {
                let x = internal::vector_input(inputs, 0);
                check(density.dim(), x.len())?;
                Ok(Value::LogDensity(density.log_density(x)?))
            }
            Node::LinearMap(map) => {
                let x = internal::vector_input(inputs, 0);
                check(map.input_dim(), x.len())?;
                Ok(Value::Vector(map.apply(x)))
            }
            Node::MultinomialLogit(likelihood) => {
                let eta = internal::vector_input(inputs, 0);
                check(likelihood.input_dim(), eta.len())?;
                Ok(Value::LogDensity(likelihood.log_density(eta)))
            }
            Node::Sum { .. } => {
                let total = inputs
                    .iter()
                    .map(|value| match value {
                        Value::LogDensity(v) => *v,
                        Value::Vector(_) => f64::NAN,
                    })
                    .fold(0.0, |acc, v| acc + v);
                Ok(Value::LogDensity(finite_or_reject(total)))
            }
        }
    }
}

/// A directed edge from an output slot to an input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub from_slot: usize,
    pub to: NodeId,
    pub to_slot: usize,
}

/// Nodes plus the edges between them.
#[derive(Debug, Clone, Default)]
pub struct DensityGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

/// Every node's output after one evaluation, indexed by `NodeId`.
#[derive(Debug, Clone)]
pub struct GraphValues {
    values: Vec<Value>,
}

impl GraphValues {
    pub fn get(&self, node: NodeId) -> Option<&Value> {
        self.values.get(node)
    }

    pub fn log_density(&self, node: NodeId) -> Option<f64> {
        match self.values.get(node)? {
            Value::LogDensity(v) => Some(*v),
            Value::Vector(_) => None,
        }
    }

    pub fn vector(&self, node: NodeId) -> Option<&Array1<f64>> {
        match self.values.get(node)? {
            Value::Vector(v) => Some(v),
            Value::LogDensity(_) => None,
        }
    }
}

impl DensityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Connects output `from_slot` of `from` to input `to_slot` of `to`.
    pub fn connect(
        &mut self,
        from: NodeId,
        from_slot: usize,
        to: NodeId,
        to_slot: usize,
    ) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        let source = self.nodes.get(from).ok_or(GraphError::UnknownNode(from))?;
        let target = self.nodes.get(to).ok_or(GraphError::UnknownNode(to))?;

        let from_kind = *source
            .output_slots()
            .get(from_slot)
            .ok_or(GraphError::UnknownSlot {
                node: from,
                name: source.name(),
                direction: "output",
                slot: from_slot,
            })?;
        let to_kind = *target
            .input_slots()
            .get(to_slot)
            .ok_or(GraphError::UnknownSlot {
                node: to,
                name: target.name(),
                direction: "input",
                slot: to_slot,
            })?;
        if from_kind != to_kind {
            return Err(GraphError::SlotKindMismatch {
                from: from_kind,
                to: to_kind,
            });
        }
        if self
            .edges
            .iter()
            .any(|e| e.to == to && e.to_slot == to_slot)
        {
            return Err(GraphError::SlotOccupied { node: to, slot: to_slot });
        }

        self.edges.push(Edge {
            from,
            from_slot,
            to,
            to_slot,
        });
        Ok(())
    }

    /// Kahn's algorithm; ties resolved by ascending node id so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            in_degree[edge.to] += 1;
        }
        let mut ready: VecDeque<NodeId> = (0..self.nodes.len())
            .filter(|&id| in_degree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.from == id) {
                in_degree[edge.to] -= 1;
                if in_degree[edge.to] == 0 {
                    ready.push_back(edge.to);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }

    /// Checks that every input slot of every node is fed by exactly one edge.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (id, node) in self.nodes.iter().enumerate() {
            for slot in 0..node.input_slots().len() {
                if !self.edges.iter().any(|e| e.to == id && e.to_slot == slot) {
                    return Err(GraphError::UnconnectedInput {
                        node: id,
                        name: node.name(),
                        slot,
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Evaluates every node once with `params` fed to the `Parameters` nodes.
    pub fn evaluate(&self, params: ArrayView1<f64>) -> Result<GraphValues, GraphError> {
        let order = self.topological_order()?;
        let mut values: Vec<Option<Value>> = vec![None; self.nodes.len()];

        for id in order {
            let node = &self.nodes[id];
            let n_inputs = node.input_slots().len();
            let mut inputs: Vec<&Value> = Vec::with_capacity(n_inputs);
            for slot in 0..n_inputs {
                let edge = self
                    .edges
                    .iter()
                    .find(|e| e.to == id && e.to_slot == slot)
                    .ok_or(GraphError::UnconnectedInput {
                        node: id,
                        name: node.name(),
                        slot,
                    })?;
                // Topological order guarantees the source was evaluated.
                let source = values[edge.from].as_ref().ok_or(GraphError::Cycle)?;
                inputs.push(source);
            }
            let value = node.evaluate(id, params, &inputs)?;
            values[id] = Some(value);
        }

        Ok(GraphValues {
            values: values.into_iter().flatten().collect(),
        })
    }
}

mod internal {
    use super::*;

    /// Connection checks guarantee slot kinds, so a mismatch here is unreachable
    /// and degrades to an empty vector that fails the dimension check.
    pub(super) fn vector_input<'a>(inputs: &[&'a Value], slot: usize) -> ArrayView1<'a, f64> {
        match inputs.get(slot) {
            Some(Value::Vector(v)) => v.view(),
            _ => ArrayView1::from(&[][..]),
        }
    }
}
