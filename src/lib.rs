#![deny(dead_code)]
#![deny(unused_imports)]

pub mod condition;
pub mod evaluate;
pub mod faer_ndarray;
pub mod kernel;
pub mod probability;
pub mod types;

pub use condition::{ConditioningSpec, MixtureReduction, evaluate_conditioned};
pub use evaluate::{EvalOutputs, EvaluationError, Evaluator, evaluate};
pub use types::{Covariance, CovarianceKind, EvalOptions, Mixture, Output};
