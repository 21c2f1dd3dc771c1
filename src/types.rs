use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::evaluate::EvaluationError;

/// Structural tag identifying one of the six covariance encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceKind {
    Full,
    SharedFull,
    Diagonal,
    SharedDiagonal,
    Isotropic,
    SharedIsotropic,
}

/// Covariance payload for a mixture.
///
/// Each variant carries variances (σ², not standard deviations). The variant
/// itself is the type tag, so payload shape and tag cannot disagree; what
/// remains to check is consistency with the mixture's component count M and
/// dimension D.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Covariance {
    /// One D×D matrix per component.
    Full(Vec<Array2<f64>>),
    /// A single D×D matrix shared by every component.
    SharedFull(Array2<f64>),
    /// M×D matrix, one row of axis variances per component.
    Diagonal(Array2<f64>),
    /// D axis variances shared by every component.
    SharedDiagonal(Array1<f64>),
    /// One variance per component.
    Isotropic(Array1<f64>),
    /// A single variance shared by every component.
    SharedIsotropic(f64),
}

impl Covariance {
    pub fn kind(&self) -> CovarianceKind {
        match self {
            Covariance::Full(_) => CovarianceKind::Full,
            Covariance::SharedFull(_) => CovarianceKind::SharedFull,
            Covariance::Diagonal(_) => CovarianceKind::Diagonal,
            Covariance::SharedDiagonal(_) => CovarianceKind::SharedDiagonal,
            Covariance::Isotropic(_) => CovarianceKind::Isotropic,
            Covariance::SharedIsotropic(_) => CovarianceKind::SharedIsotropic,
        }
    }
}

/// A finite Gaussian mixture: M components over D dimensions.
///
/// Mixing weights are assumed non-negative and summing to 1; that is a
/// caller contract and is not re-validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mixture {
    centroids: Array2<f64>,
    covariance: Covariance,
    weights: Array1<f64>,
}

impl Mixture {
    /// Build a mixture, checking that the covariance payload and weight
    /// vector are consistent with the centroid matrix.
    pub fn new(
        centroids: Array2<f64>,
        covariance: Covariance,
        weights: Array1<f64>,
    ) -> Result<Self, EvaluationError> {
        let (m, d) = centroids.dim();
        if m == 0 || d == 0 {
            return Err(EvaluationError::ShapeMismatch(format!(
                "centroid matrix must be non-empty, got {m}×{d}"
            )));
        }
        if weights.len() != m {
            return Err(EvaluationError::ShapeMismatch(format!(
                "{} weights for {m} components",
                weights.len()
            )));
        }
        match &covariance {
            Covariance::Full(mats) => {
                if mats.len() != m {
                    return Err(EvaluationError::ShapeMismatch(format!(
                        "{} covariance matrices for {m} components",
                        mats.len()
                    )));
                }
                for (j, sigma) in mats.iter().enumerate() {
                    if sigma.dim() != (d, d) {
                        return Err(EvaluationError::ShapeMismatch(format!(
                            "covariance matrix for component {j} is {}×{}, expected {d}×{d}",
                            sigma.nrows(),
                            sigma.ncols()
                        )));
                    }
                }
            }
            Covariance::SharedFull(sigma) => {
                if sigma.dim() != (d, d) {
                    return Err(EvaluationError::ShapeMismatch(format!(
                        "shared covariance matrix is {}×{}, expected {d}×{d}",
                        sigma.nrows(),
                        sigma.ncols()
                    )));
                }
            }
            Covariance::Diagonal(vars) => {
                if vars.dim() != (m, d) {
                    return Err(EvaluationError::ShapeMismatch(format!(
                        "diagonal variance matrix is {}×{}, expected {m}×{d}",
                        vars.nrows(),
                        vars.ncols()
                    )));
                }
            }
            Covariance::SharedDiagonal(vars) => {
                if vars.len() != d {
                    return Err(EvaluationError::ShapeMismatch(format!(
                        "shared diagonal has {} variances for dimension {d}",
                        vars.len()
                    )));
                }
            }
            Covariance::Isotropic(vars) => {
                if vars.len() != m {
                    return Err(EvaluationError::ShapeMismatch(format!(
                        "{} isotropic variances for {m} components",
                        vars.len()
                    )));
                }
            }
            Covariance::SharedIsotropic(_) => {}
        }
        Ok(Self {
            centroids,
            covariance,
            weights,
        })
    }

    pub fn n_components(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn dim(&self) -> usize {
        self.centroids.ncols()
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }

    pub fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }
}

/// Which of the four related quantities to materialize.
///
/// Requests form a prefix of the fixed derivation order density, then
/// likelihood, then posterior, then joint: asking for `Posterior` also
/// yields the density and per-component likelihoods, while anything past
/// the requested point is never computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Output {
    Density,
    Likelihood,
    Posterior,
    Joint,
}

pub fn default_parallel_threshold() -> usize {
    8
}

/// Engine-only evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOptions {
    /// Return log-quantities instead of plain densities. Log mode stays
    /// exact where linear mode underflows to zero.
    #[serde(default)]
    pub log_output: bool,
    /// Process the query set in row chunks of this size to bound the N×M
    /// intermediate. Batched and unbatched evaluation are numerically
    /// identical.
    #[serde(default)]
    pub batch_rows: Option<usize>,
    /// Component count at which per-component eigendecompositions run in
    /// parallel.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            log_output: false,
            batch_rows: None,
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

impl EvalOptions {
    pub fn log() -> Self {
        Self {
            log_output: true,
            ..Self::default()
        }
    }
}
