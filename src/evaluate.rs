//! Stable combination of the adjusted log-kernel into the four related
//! output quantities: marginal density, per-component likelihood, posterior
//! membership probabilities, and joint density.
//!
//! All four derive from one N×M adjusted log-kernel. The [`Evaluator`]
//! computes each quantity lazily and caches it, so a caller requesting only
//! the density never pays for the posterior, while every request depth goes
//! through the same code path.

use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};
use thiserror::Error;

use crate::faer_ndarray::FaerLinalgError;
use crate::kernel::adjusted_log_kernel;
use crate::probability::log_norm_constant;
use crate::types::{EvalOptions, Mixture, Output};

/// Errors surfaced by mixture construction, evaluation, and conditioning.
#[derive(Error)]
pub enum EvaluationError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Degenerate covariance: {0}")]
    DegenerateCovariance(String),

    #[error("Eigendecomposition failed: {0}")]
    Eigendecomposition(#[from] FaerLinalgError),

    #[error("Invalid conditioning specification: {0}")]
    InvalidConditioningSpec(String),
}

// Ensure Debug prints with the full message by delegating to Display.
impl core::fmt::Debug for EvaluationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Default, Clone, Copy)]
struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    fn sum(self) -> f64 {
        self.sum
    }
}

/// Lazily-evaluated view of one query/mixture problem.
///
/// Intermediates (the adjusted log-kernel and its log-weighted variant) and
/// each of the four outputs are computed on first access and cached for the
/// lifetime of the evaluator.
pub struct Evaluator<'a> {
    query: ArrayView2<'a, f64>,
    mixture: &'a Mixture,
    options: EvalOptions,
    log_kernel: Option<Array2<f64>>,
    log_weighted: Option<Array2<f64>>,
    density: Option<Array1<f64>>,
    likelihood: Option<Array2<f64>>,
    posterior: Option<Array2<f64>>,
    joint: Option<Array2<f64>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        query: ArrayView2<'a, f64>,
        mixture: &'a Mixture,
        options: EvalOptions,
    ) -> Result<Self, EvaluationError> {
        if query.ncols() != mixture.dim() {
            return Err(EvaluationError::ShapeMismatch(format!(
                "query has {} columns, mixture dimension is {}",
                query.ncols(),
                mixture.dim()
            )));
        }
        Ok(Self {
            query,
            mixture,
            options,
            log_kernel: None,
            log_weighted: None,
            density: None,
            likelihood: None,
            posterior: None,
            joint: None,
        })
    }

    fn log_kernel(&mut self) -> Result<&Array2<f64>, EvaluationError> {
        if self.log_kernel.is_none() {
            let kernel =
                adjusted_log_kernel(self.query, self.mixture, self.options.parallel_threshold)?;
            self.log_kernel = Some(kernel);
        }
        Ok(self.log_kernel.as_ref().expect("kernel cached above"))
    }

    /// Adjusted log-kernel with `log w_m` folded into each column.
    fn log_weighted(&mut self) -> Result<&Array2<f64>, EvaluationError> {
        if self.log_weighted.is_none() {
            let weights = self.mixture.weights().clone();
            let mut weighted = self.log_kernel()?.clone();
            for (j, &w) in weights.iter().enumerate() {
                let log_w = w.ln();
                weighted.column_mut(j).mapv_inplace(|v| v + log_w);
            }
            self.log_weighted = Some(weighted);
        }
        Ok(self.log_weighted.as_ref().expect("cached above"))
    }

    /// Per-component likelihood p(x|m) as an N×M matrix, or its log.
    ///
    /// In log mode no exponentiation happens, so the values stay exact even
    /// where linear mode would underflow to zero.
    pub fn likelihood(&mut self) -> Result<&Array2<f64>, EvaluationError> {
        if self.likelihood.is_none() {
            let log_norm = log_norm_constant(self.mixture.dim());
            let log_mode = self.options.log_output;
            let mut lik = self.log_kernel()?.clone();
            if log_mode {
                lik.mapv_inplace(|v| v + log_norm);
            } else {
                lik.mapv_inplace(|v| (v + log_norm).exp());
            }
            self.likelihood = Some(lik);
        }
        Ok(self.likelihood.as_ref().expect("cached above"))
    }

    /// Marginal density p(x) = Σ_m w_m p(x|m), or its log.
    pub fn density(&mut self) -> Result<&Array1<f64>, EvaluationError> {
        if self.density.is_none() {
            let density = if self.options.log_output {
                self.log_density()?
            } else {
                self.linear_density()?
            };
            self.density = Some(density);
        }
        Ok(self.density.as_ref().expect("cached above"))
    }

    /// Stable log-sum-exp over the log-weighted kernel: shift by the row
    /// maximum, exponentiate, sum, shift back.
    fn log_density(&mut self) -> Result<Array1<f64>, EvaluationError> {
        let log_norm = log_norm_constant(self.mixture.dim());
        let weighted = self.log_weighted()?;
        let mut out = Array1::zeros(weighted.nrows());
        for (i, row) in weighted.rows().into_iter().enumerate() {
            let row_max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if !row_max.is_finite() {
                // An all -∞ row would otherwise produce NaN from -∞ - -∞.
                out[i] = if row.iter().any(|v| v.is_nan()) {
                    f64::NAN
                } else {
                    f64::NEG_INFINITY
                };
                continue;
            }
            let mut sum = KahanSum::default();
            for &v in row {
                sum.add((v - row_max).exp());
            }
            out[i] = row_max + sum.sum().ln() + log_norm;
        }
        Ok(out)
    }

    /// Direct weighted sum of the exponentiated likelihoods. A point far
    /// from every component can underflow to an exact zero here; that is
    /// the documented precision limit of linear mode.
    fn linear_density(&mut self) -> Result<Array1<f64>, EvaluationError> {
        let weights = self.mixture.weights().clone();
        let lik = self.likelihood()?;
        let mut out = Array1::zeros(lik.nrows());
        for (i, row) in lik.rows().into_iter().enumerate() {
            let mut sum = KahanSum::default();
            for (&p, &w) in row.iter().zip(weights.iter()) {
                sum.add(w * p);
            }
            out[i] = sum.sum();
        }
        let underflowed = out.iter().filter(|&&v| v == 0.0).count();
        if underflowed > 0 {
            log::warn!(
                "marginal density underflowed to zero for {underflowed} of {} query points \
                 in linear mode; request log output for exact values",
                out.len()
            );
        }
        Ok(out)
    }

    /// Posterior membership p(m|x), rows normalized to sum to 1.
    ///
    /// Always derived from the log-weighted kernel with a shift by the row
    /// maximum, so the result is identical in log and linear output modes
    /// and stays exact even when every raw likelihood underflows in linear
    /// arithmetic (the shift cancels in the ratio). A row whose weighted
    /// kernel is entirely -∞ has no meaningful posterior and is filled
    /// with NaN.
    pub fn posterior(&mut self) -> Result<&Array2<f64>, EvaluationError> {
        if self.posterior.is_none() {
            let mut post = self.log_weighted()?.clone();
            for mut row in post.rows_mut() {
                let row_max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if !row_max.is_finite() {
                    row.fill(f64::NAN);
                    continue;
                }
                row.mapv_inplace(|v| (v - row_max).exp());
                let mut total = KahanSum::default();
                for &v in row.iter() {
                    total.add(v);
                }
                let total = total.sum();
                row.mapv_inplace(|v| v / total);
            }
            self.posterior = Some(post);
        }
        Ok(self.posterior.as_ref().expect("cached above"))
    }

    /// Joint density p(x, m) = p(x|m)·w_m, or the log-additive equivalent.
    pub fn joint(&mut self) -> Result<&Array2<f64>, EvaluationError> {
        if self.joint.is_none() {
            let weights = self.mixture.weights().clone();
            let log_mode = self.options.log_output;
            let mut joint = self.likelihood()?.clone();
            for (j, &w) in weights.iter().enumerate() {
                if log_mode {
                    let log_w = w.ln();
                    joint.column_mut(j).mapv_inplace(|v| v + log_w);
                } else {
                    joint.column_mut(j).mapv_inplace(|v| v * w);
                }
            }
            self.joint = Some(joint);
        }
        Ok(self.joint.as_ref().expect("cached above"))
    }
}

/// Materialized outputs of one evaluation call.
///
/// The density is always present; the later quantities are filled through
/// the requested prefix of the derivation order.
#[derive(Debug, Clone)]
pub struct EvalOutputs {
    pub density: Array1<f64>,
    pub likelihood: Option<Array2<f64>>,
    pub posterior: Option<Array2<f64>>,
    pub joint: Option<Array2<f64>>,
}

fn evaluate_unbatched<'a>(
    query: ArrayView2<'a, f64>,
    mixture: &'a Mixture,
    options: &EvalOptions,
    request: Output,
) -> Result<EvalOutputs, EvaluationError> {
    let mut eval = Evaluator::new(query, mixture, options.clone())?;
    let density = eval.density()?.clone();
    let likelihood = if request >= Output::Likelihood {
        Some(eval.likelihood()?.clone())
    } else {
        None
    };
    let posterior = if request >= Output::Posterior {
        Some(eval.posterior()?.clone())
    } else {
        None
    };
    let joint = if request >= Output::Joint {
        Some(eval.joint()?.clone())
    } else {
        None
    };
    Ok(EvalOutputs {
        density,
        likelihood,
        posterior,
        joint,
    })
}

fn concat_rows(parts: Vec<ArrayView2<'_, f64>>) -> Result<Array2<f64>, EvaluationError> {
    concatenate(Axis(0), &parts).map_err(|e| EvaluationError::ShapeMismatch(e.to_string()))
}

fn concat_outputs(pieces: &[EvalOutputs]) -> Result<EvalOutputs, EvaluationError> {
    let density = concatenate(
        Axis(0),
        &pieces.iter().map(|p| p.density.view()).collect::<Vec<_>>(),
    )
    .map_err(|e| EvaluationError::ShapeMismatch(e.to_string()))?;
    let likelihood = if pieces[0].likelihood.is_some() {
        Some(concat_rows(
            pieces
                .iter()
                .filter_map(|p| p.likelihood.as_ref().map(|a| a.view()))
                .collect(),
        )?)
    } else {
        None
    };
    let posterior = if pieces[0].posterior.is_some() {
        Some(concat_rows(
            pieces
                .iter()
                .filter_map(|p| p.posterior.as_ref().map(|a| a.view()))
                .collect(),
        )?)
    } else {
        None
    };
    let joint = if pieces[0].joint.is_some() {
        Some(concat_rows(
            pieces
                .iter()
                .filter_map(|p| p.joint.as_ref().map(|a| a.view()))
                .collect(),
        )?)
    } else {
        None
    };
    Ok(EvalOutputs {
        density,
        likelihood,
        posterior,
        joint,
    })
}

/// Evaluate `mixture` at the rows of `query`, producing the requested
/// prefix of (density, likelihood, posterior, joint).
///
/// With `batch_rows` set, the query matrix is processed in row chunks and
/// the outputs concatenated; rows are independent, so the result is
/// identical to the unbatched one and only peak memory changes.
///
/// In linear mode the marginal density of a point far from every component
/// can underflow to exactly zero (and a warning is logged); log mode stays
/// exact in that regime and is the right choice when tail probabilities
/// matter. Posteriors are stable in both modes.
pub fn evaluate<'a>(
    query: ArrayView2<'a, f64>,
    mixture: &'a Mixture,
    options: &EvalOptions,
    request: Output,
) -> Result<EvalOutputs, EvaluationError> {
    let n = query.nrows();
    match options.batch_rows {
        Some(batch) if batch > 0 && batch < n => {
            let mut pieces = Vec::with_capacity(n.div_ceil(batch));
            let mut start = 0;
            while start < n {
                let end = (start + batch).min(n);
                pieces.push(evaluate_unbatched(
                    query.slice(s![start..end, ..]),
                    mixture,
                    options,
                    request,
                )?);
                start = end;
            }
            concat_outputs(&pieces)
        }
        _ => evaluate_unbatched(query, mixture, options, request),
    }
}
