//! Conditioning adapter: evaluate a mixture after fixing some variables and
//! marginalizing out others.
//!
//! The reduction itself (deriving the mixture of the missing variables given
//! the present ones) is an external collaborator behind the
//! [`MixtureReduction`] trait. The adapter only does the bookkeeping: it
//! validates the specification, slices the query matrix down to the missing
//! columns, and re-invokes the density engine on the reduced problem.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

use crate::evaluate::{EvalOutputs, EvaluationError, evaluate};
use crate::types::{EvalOptions, Mixture, Output};

/// Which variables are observed, their observed values, and which variables
/// the reduced mixture is evaluated over. Indices are 0-based columns of
/// the query matrix; any index in neither set is marginalized away.
#[derive(Debug, Clone)]
pub struct ConditioningSpec {
    pub present: Vec<usize>,
    pub values: Array1<f64>,
    pub missing: Vec<usize>,
}

impl ConditioningSpec {
    /// A specification with nothing conditioned and nothing marginalized,
    /// behaviorally identical to omitting the specification.
    pub fn is_empty(&self) -> bool {
        self.present.is_empty() && self.missing.is_empty()
    }

    pub fn validate(&self, dim: usize) -> Result<(), EvaluationError> {
        if self.values.len() != self.present.len() {
            return Err(EvaluationError::InvalidConditioningSpec(format!(
                "{} conditioned values for {} present indices",
                self.values.len(),
                self.present.len()
            )));
        }
        if self.missing.is_empty() {
            return Err(EvaluationError::InvalidConditioningSpec(
                "missing index set is empty, nothing to evaluate".to_string(),
            ));
        }
        let mut seen = vec![false; dim];
        for &idx in self.present.iter().chain(self.missing.iter()) {
            if idx >= dim {
                return Err(EvaluationError::InvalidConditioningSpec(format!(
                    "index {idx} out of range for dimension {dim}"
                )));
            }
            if seen[idx] {
                return Err(EvaluationError::InvalidConditioningSpec(format!(
                    "index {idx} appears more than once across present and missing sets"
                )));
            }
            seen[idx] = true;
        }
        Ok(())
    }
}

/// External collaborator that conditions and marginalizes a mixture down to
/// the `missing` variables.
///
/// The returned mixture must be over `missing.len()` dimensions and may use
/// any of the six covariance encodings, not necessarily the input's one.
pub trait MixtureReduction {
    fn reduce(
        &self,
        mixture: &Mixture,
        present: &[usize],
        values: ArrayView1<'_, f64>,
        missing: &[usize],
    ) -> Result<Mixture, EvaluationError>;
}

/// Evaluate with an optional conditioning specification.
///
/// Without a specification (or with an empty one) this is exactly
/// [`evaluate`] over all dimensions. Otherwise the query matrix keeps its
/// full width D; only the `missing` columns are read, sliced out, and
/// evaluated against the reduced mixture obtained from `reducer`.
pub fn evaluate_conditioned<'a, R: MixtureReduction>(
    query: ArrayView2<'a, f64>,
    mixture: &'a Mixture,
    conditioning: Option<&ConditioningSpec>,
    reducer: &R,
    options: &EvalOptions,
    request: Output,
) -> Result<EvalOutputs, EvaluationError> {
    let spec = match conditioning {
        Some(spec) if !spec.is_empty() => spec,
        _ => return evaluate(query, mixture, options, request),
    };
    if query.ncols() != mixture.dim() {
        return Err(EvaluationError::ShapeMismatch(format!(
            "query has {} columns, mixture dimension is {}",
            query.ncols(),
            mixture.dim()
        )));
    }
    spec.validate(mixture.dim())?;

    let sliced = query.select(Axis(1), &spec.missing);
    let reduced = reducer.reduce(mixture, &spec.present, spec.values.view(), &spec.missing)?;
    if reduced.dim() != spec.missing.len() {
        return Err(EvaluationError::ShapeMismatch(format!(
            "reduction returned a {}-dimensional mixture for {} missing variables",
            reduced.dim(),
            spec.missing.len()
        )));
    }
    evaluate(sliced.view(), &reduced, options, request)
}
